use serde::{Deserialize, Serialize};

use leasebook_core::{DomainError, DomainResult};

/// Prefix of every agreement identifier sequence name.
pub const SEQUENCE_PREFIX: &str = "agreement_identifier";

const MAX_PART_LEN: usize = 20;

/// The (type, municipality, district) triple an identifier sequence runs in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgreementIdentifierScope {
    type_identifier: String,
    municipality: String,
    district: u32,
}

impl AgreementIdentifierScope {
    /// `type_identifier` is e.g. `MA`, `municipality` e.g. `1`, and
    /// `district` the district identifier, which must be numeric (`22`).
    pub fn new(
        type_identifier: impl Into<String>,
        municipality: impl Into<String>,
        district: &str,
    ) -> DomainResult<Self> {
        let type_identifier = type_identifier.into();
        let municipality = municipality.into();

        check_part("type identifier", &type_identifier)?;
        check_part("municipality", &municipality)?;

        let district = district.trim().parse::<u32>().map_err(|_| {
            DomainError::validation(format!("district identifier '{district}' is not a number"))
        })?;

        Ok(Self {
            type_identifier,
            municipality,
            district,
        })
    }

    pub fn type_identifier(&self) -> &str {
        &self.type_identifier
    }

    pub fn municipality(&self) -> &str {
        &self.municipality
    }

    pub fn district(&self) -> u32 {
        self.district
    }

    /// Name of the counter that numbers agreements in this scope.
    pub fn sequence_name(&self) -> String {
        format!(
            "{SEQUENCE_PREFIX}:{}:{}:{}",
            self.type_identifier, self.municipality, self.district
        )
    }

    /// Combine the scope with an allocated running number.
    pub fn identifier(&self, sequence: i64) -> DomainResult<AgreementIdentifier> {
        if sequence < 1 {
            return Err(DomainError::invariant(format!(
                "agreement sequence must start at 1 (got {sequence})"
            )));
        }
        Ok(AgreementIdentifier {
            scope: self.clone(),
            sequence,
        })
    }
}

fn check_part(what: &str, value: &str) -> DomainResult<()> {
    if value.is_empty() {
        return Err(DomainError::validation(format!("{what} must not be empty")));
    }
    if value.len() > MAX_PART_LEN {
        return Err(DomainError::validation(format!(
            "{what} longer than {MAX_PART_LEN} characters"
        )));
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(DomainError::validation(format!(
            "{what} '{value}' must be ASCII letters or digits"
        )));
    }
    Ok(())
}

/// A land use agreement identifier such as `MA122-1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgreementIdentifier {
    scope: AgreementIdentifierScope,
    sequence: i64,
}

impl AgreementIdentifier {
    pub fn scope(&self) -> &AgreementIdentifierScope {
        &self.scope
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }
}

impl core::fmt::Display for AgreementIdentifier {
    /// `{type}{municipality}{district:02}-{sequence}`
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}{}{:02}-{}",
            self.scope.type_identifier, self.scope.municipality, self.scope.district, self.sequence
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn renders_helsinki_vallila_example() {
        let scope = AgreementIdentifierScope::new("MA", "1", "22").unwrap();
        assert_eq!(scope.identifier(1).unwrap().to_string(), "MA122-1");
    }

    #[test]
    fn single_digit_district_is_zero_padded() {
        let scope = AgreementIdentifierScope::new("MA", "1", "3").unwrap();
        assert_eq!(scope.identifier(17).unwrap().to_string(), "MA103-17");
    }

    #[test]
    fn district_with_leading_zero_parses() {
        let scope = AgreementIdentifierScope::new("MA", "1", "05").unwrap();
        assert_eq!(scope.district(), 5);
    }

    #[test]
    fn non_numeric_district_is_rejected() {
        let err = AgreementIdentifierScope::new("MA", "1", "Vallila").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn empty_or_symbolic_parts_are_rejected() {
        assert!(AgreementIdentifierScope::new("", "1", "22").is_err());
        assert!(AgreementIdentifierScope::new("MA", "1:2", "22").is_err());
    }

    #[test]
    fn sequence_name_is_scope_specific() {
        let a = AgreementIdentifierScope::new("MA", "1", "22").unwrap();
        let b = AgreementIdentifierScope::new("MA", "1", "23").unwrap();
        assert_eq!(a.sequence_name(), "agreement_identifier:MA:1:22");
        assert_ne!(a.sequence_name(), b.sequence_name());
    }

    #[test]
    fn sequence_must_be_positive() {
        let scope = AgreementIdentifierScope::new("MA", "1", "22").unwrap();
        assert!(scope.identifier(0).is_err());
    }

    proptest! {
        #[test]
        fn display_ends_with_sequence(seq in 1i64..10_000_000i64, district in 0u32..100u32) {
            let scope = AgreementIdentifierScope::new("MA", "1", &district.to_string()).unwrap();
            let rendered = scope.identifier(seq).unwrap().to_string();
            let expected_suffix = format!("-{seq}");
            prop_assert!(rendered.ends_with(&expected_suffix));
            prop_assert!(rendered.starts_with("MA1"));
        }
    }
}
