//! Input checks applied before anything is persisted

use crate::attributes::{Attribute, AttributeKind, AttributeValue};
use crate::persistence::{Device, MicroserviceDefinition};
use crate::policy::KNOWN_PROTOCOLS;

use super::RegistrationError;

/// Field name reported for attribute-level failures.
pub(crate) const ATTRIBUTE_TYPE_FIELD: &str = "service.[attribute].type";
pub(crate) const ATTRIBUTE_MAPPINGS_FIELD: &str = "service.[attribute].mappings";

/// A check run on each attribute of a request.
pub(crate) type AttributeVerifier<'a> = Box<dyn Fn(&Attribute) -> Result<(), RegistrationError> + 'a>;

/// Reject identifiers containing anything outside the allowed character set.
pub(crate) fn check_input_string(field: &str, value: &str) -> Result<(), RegistrationError> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || "-_./:@+~#".contains(c);
    match value.chars().find(|c| !allowed(*c)) {
        None => Ok(()),
        Some(bad) => Err(RegistrationError::user_input(
            field,
            format!("contains the illegal character {:?}", bad),
        )),
    }
}

/// Every user input variable must be typed as declared, and every variable
/// without a default must be supplied.
pub(crate) fn user_input_verifier(def: &MicroserviceDefinition) -> AttributeVerifier<'_> {
    Box::new(move |attr: &Attribute| {
        let AttributeValue::UserInput { mappings } = &attr.value else {
            return Ok(());
        };

        for (name, value) in mappings {
            if let Some(declared) = def.user_input(name) {
                declared.check_value(value).map_err(|detail| {
                    RegistrationError::user_input(
                        "variables",
                        format!("variable {} for service {}/{}: {}", name, def.org, def.url, detail),
                    )
                })?;
            }
        }

        if let Some(missing) = def
            .user_inputs
            .iter()
            .find(|ui| ui.is_required() && !mappings.contains_key(&ui.name))
        {
            return Err(missing_variable(&missing.name, def));
        }
        Ok(())
    })
}

/// Pattern-bound nodes take every policy term from the pattern.
pub(crate) fn pattern_verifier(device: &Device) -> AttributeVerifier<'_> {
    Box::new(move |attr: &Attribute| {
        if device.is_pattern_bound() && attr.kind().is_policy_generating() {
            return Err(RegistrationError::user_input(
                ATTRIBUTE_TYPE_FIELD,
                format!(
                    "device is using pattern {}, {} are not supported",
                    device.pattern,
                    attr.kind()
                ),
            ));
        }
        Ok(())
    })
}

pub(crate) fn protocol_verifier() -> AttributeVerifier<'static> {
    Box::new(|attr: &Attribute| {
        let AttributeValue::AgreementProtocol { protocols } = &attr.value else {
            return Ok(());
        };
        match protocols
            .iter()
            .find(|p| !KNOWN_PROTOCOLS.contains(&p.name.as_str()))
        {
            Some(unknown) => Err(RegistrationError::user_input(
                "service.[attribute].protocols",
                format!("unsupported agreement protocol {}", unknown.name),
            )),
            None => Ok(()),
        }
    })
}

/// Run every verifier over every attribute.
///
/// The first failing verifier stops checks on that attribute; the remaining
/// attributes are still checked and the earliest failure is returned.
pub(crate) fn verify_attributes(
    attrs: &[Attribute],
    verifiers: &[AttributeVerifier<'_>],
) -> Result<(), RegistrationError> {
    let failures: Vec<RegistrationError> = attrs
        .iter()
        .filter_map(|attr| verifiers.iter().find_map(|verify| verify(attr).err()))
        .collect();

    match failures.into_iter().next() {
        Some(first) => Err(first),
        None => Ok(()),
    }
}

/// Drop repeated Architecture attributes and reject any other repeated variant.
pub(crate) fn dedupe_variants(attrs: Vec<Attribute>) -> Result<Vec<Attribute>, RegistrationError> {
    let mut seen: Vec<AttributeKind> = Vec::new();
    let mut out = Vec::with_capacity(attrs.len());

    for attr in attrs {
        let kind = attr.kind();
        if seen.contains(&kind) {
            if kind == AttributeKind::Architecture {
                continue;
            }
            return Err(RegistrationError::user_input(
                ATTRIBUTE_TYPE_FIELD,
                format!("{} specified more than once", kind),
            ));
        }
        seen.push(kind);
        out.push(attr);
    }
    Ok(out)
}

pub(crate) fn missing_variable(name: &str, def: &MicroserviceDefinition) -> RegistrationError {
    RegistrationError::user_input(
        ATTRIBUTE_MAPPINGS_FIELD,
        format!(
            "variable {} for service {}/{} is missing a value",
            name, def.org, def.url
        ),
    )
}
