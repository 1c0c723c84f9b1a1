/// Errors raised by `PropertyBag` operations.
///
/// Registration errors are configuration mistakes and surface at setup time;
/// nothing here is produced by malformed remote data, which is dropped instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BagError {
    #[error("property already registered: {0}")]
    DuplicateProperty(String),

    #[error("unknown property: {0}")]
    UnknownProperty(String),

    #[error("property {key} holds {actual}, not {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("failed to serialize property {key}: {reason}")]
    Serialize { key: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_property() {
        let err = BagError::DuplicateProperty("health".into());
        assert_eq!(err.to_string(), "property already registered: health");

        let err = BagError::TypeMismatch {
            key: "position".into(),
            expected: "f64",
            actual: "[f64; 3]",
        };
        assert_eq!(err.to_string(), "property position holds [f64; 3], not f64");
    }
}
