#![forbid(unsafe_code)]

use std::collections::BTreeMap;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct SchemaVersion(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub enum ContractViolation {
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
    InvalidTransition {
        field: &'static str,
        from: &'static str,
        to: &'static str,
    },
}

impl std::fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { field, reason } => write!(f, "{field}: {reason}"),
            Self::InvalidTransition { field, from, to } => {
                write!(f, "{field}: cannot move from {from} to {to}")
            }
        }
    }
}

impl std::error::Error for ContractViolation {}

pub trait Validate {
    fn validate(&self) -> Result<(), ContractViolation>;
}

/// Every field that failed validation, keyed by dotted path (`knowledge.content`).
///
/// Serializes as a plain `{field: [reason, ...]}` object so it can be returned
/// verbatim in a response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct FieldViolations(BTreeMap<String, Vec<String>>);

impl FieldViolations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: impl Into<String>, reason: impl Into<String>) {
        self.0.entry(field.into()).or_default().push(reason.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn reasons(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    /// `Ok(value)` when nothing was recorded, otherwise the collected violations.
    pub fn into_result<T>(self, value: T) -> Result<T, FieldViolations> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

impl std::fmt::Display for FieldViolations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (field, reasons) in &self.0 {
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            write!(f, "{field}: {}", reasons.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for FieldViolations {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_common_01_field_violations_group_reasons_per_field() {
        let mut v = FieldViolations::new();
        v.push("name", "name is required");
        v.push("voiceId", "must be a string");
        v.push("voiceId", "must be a valid UUID");

        assert_eq!(v.len(), 2);
        assert_eq!(v.fields().collect::<Vec<_>>(), vec!["name", "voiceId"]);
        assert_eq!(v.reasons("voiceId").unwrap().len(), 2);
        assert!(v.reasons("coverImageUrl").is_none());
    }

    #[test]
    fn at_common_02_field_violations_serialize_as_plain_map() {
        let mut v = FieldViolations::new();
        v.push("knowledge.content", "knowledge content is required");
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"knowledge.content": ["knowledge content is required"]})
        );
    }

    #[test]
    fn at_common_03_empty_violations_pass_value_through() {
        assert_eq!(FieldViolations::new().into_result(7), Ok(7));
    }
}
