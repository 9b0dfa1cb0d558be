//! Resolution of the unit key from the identifiers supplied with a request.
use serde::{Deserialize, Serialize};

/// Unit key used when a request carries no identifier at all. All anonymous traffic hashes to the
/// same bucket of every experiment.
pub const ANONYMOUS_UNIT_KEY: &str = "anon";

/// Identifiers of the unit requesting an assignment. All are optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req: Option<String>,
}

/// Identifier sources in precedence order, with the prefix each contributes to the unit key.
const PRECEDENCE: [(UnitSource, &str); 3] = [
    (UnitSource::User, "u:"),
    (UnitSource::Device, "d:"),
    (UnitSource::Request, "r:"),
];

#[derive(Debug, Clone, Copy)]
enum UnitSource {
    User,
    Device,
    Request,
}

impl UnitIdentity {
    pub fn user(user: impl Into<String>) -> UnitIdentity {
        UnitIdentity {
            user: Some(user.into()),
            ..Default::default()
        }
    }

    pub fn device(device: impl Into<String>) -> UnitIdentity {
        UnitIdentity {
            device: Some(device.into()),
            ..Default::default()
        }
    }

    fn get(&self, source: UnitSource) -> Option<&str> {
        match source {
            UnitSource::User => self.user.as_deref(),
            UnitSource::Device => self.device.as_deref(),
            UnitSource::Request => self.req.as_deref(),
        }
    }

    /// Return the unit key: the first non-empty identifier (user, then device, then request id)
    /// with its source prefix, or [`ANONYMOUS_UNIT_KEY`].
    ///
    /// Prefixes keep a user id and a device id with the same text from colliding.
    pub fn unit_key(&self) -> String {
        PRECEDENCE
            .iter()
            .find_map(|(source, prefix)| {
                self.get(*source)
                    .filter(|id| !id.is_empty())
                    .map(|id| format!("{prefix}{id}"))
            })
            .unwrap_or_else(|| ANONYMOUS_UNIT_KEY.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::{UnitIdentity, ANONYMOUS_UNIT_KEY};

    #[test]
    fn user_takes_precedence() {
        let unit = UnitIdentity {
            user: Some("42".into()),
            device: Some("dev-1".into()),
            req: Some("req-1".into()),
        };
        assert_eq!(unit.unit_key(), "u:42");
    }

    #[test]
    fn falls_back_to_device_then_request() {
        let unit = UnitIdentity {
            user: None,
            device: Some("dev-1".into()),
            req: Some("req-1".into()),
        };
        assert_eq!(unit.unit_key(), "d:dev-1");

        let unit = UnitIdentity {
            req: Some("req-1".into()),
            ..Default::default()
        };
        assert_eq!(unit.unit_key(), "r:req-1");
    }

    #[test]
    fn empty_identifiers_are_skipped() {
        let unit = UnitIdentity {
            user: Some("".into()),
            device: Some("dev-1".into()),
            req: None,
        };
        assert_eq!(unit.unit_key(), "d:dev-1");
    }

    #[test]
    fn no_identifiers_resolve_to_anonymous() {
        assert_eq!(UnitIdentity::default().unit_key(), ANONYMOUS_UNIT_KEY);
        let unit = UnitIdentity {
            user: Some("".into()),
            device: Some("".into()),
            req: Some("".into()),
        };
        assert_eq!(unit.unit_key(), ANONYMOUS_UNIT_KEY);
    }

    #[test]
    fn same_text_from_different_sources_differs() {
        assert_ne!(
            UnitIdentity::user("abc").unit_key(),
            UnitIdentity::device("abc").unit_key()
        );
    }
}
