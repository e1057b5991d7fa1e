//! Resource worker: node lifecycle reactions
//!
//! Once the node is configured, every service its pattern pins is registered
//! automatically. When the node is unconfigured every registration is archived
//! and the worker stops. Idle periods are used to sweep old archived
//! definitions.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::events::{Event, EventBus};
use crate::registrar::ServiceRegistrar;
use crate::worker::{CommandQueue, WorkerHandler};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceCommand {
    NodeConfig { org: String, pattern: String },
    NodeUnconfig,
}

pub struct ResourceWorker {
    registrar: Arc<ServiceRegistrar>,
    bus: EventBus,
    gc_retention: Duration,
}

impl ResourceWorker {
    pub fn new(registrar: Arc<ServiceRegistrar>, bus: EventBus, gc_retention: Duration) -> Self {
        Self {
            registrar,
            bus,
            gc_retention,
        }
    }

    async fn handle_node_config(&self, org: &str, pattern: &str) -> anyhow::Result<()> {
        if pattern.is_empty() {
            info!(org, "Node configured without a pattern");
            return Ok(());
        }

        let created = self.registrar.register_pattern().await?;
        for doc in created {
            self.bus.publish(Event::PolicyCreated {
                org: doc.service.org,
                url: doc.service.url,
                name: doc.name,
            });
        }
        Ok(())
    }

    fn handle_node_unconfig(&self) -> anyhow::Result<()> {
        let archived = self.registrar.unregister(None, None)?;
        info!(services = archived.len(), "Node unconfigured, registrations archived");
        for def in archived {
            self.bus.publish(Event::ServiceArchived {
                org: def.org,
                url: def.url,
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl WorkerHandler for ResourceWorker {
    type Command = ResourceCommand;

    fn name(&self) -> &str {
        "resource"
    }

    fn on_event(&mut self, event: &Event, queue: &CommandQueue<ResourceCommand>) {
        let command = match event {
            Event::NodeConfigured { org, pattern, .. } => ResourceCommand::NodeConfig {
                org: org.clone(),
                pattern: pattern.clone(),
            },
            Event::NodeUnconfigured => ResourceCommand::NodeUnconfig,
            _ => return,
        };
        if let Err(e) = queue.enqueue(command) {
            error!(error = %e, ?event, "Dropped node lifecycle event");
        }
    }

    async fn on_command(
        &mut self,
        command: ResourceCommand,
        queue: &CommandQueue<ResourceCommand>,
    ) -> anyhow::Result<bool> {
        match command {
            ResourceCommand::NodeConfig { org, pattern } => {
                self.handle_node_config(&org, &pattern).await?;
            }
            ResourceCommand::NodeUnconfig => {
                // Stop even when archiving fails; the node is going away
                let result = self.handle_node_unconfig();
                queue.terminate("node unconfigured");
                result?;
            }
        }
        Ok(true)
    }

    async fn on_idle_timeout(&mut self) {
        if let Err(e) = self.registrar.collect_garbage(self.gc_retention) {
            error!(error = %e, "Garbage collection of archived services failed");
        }
    }
}
