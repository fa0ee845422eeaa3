use serde::Deserialize;

/// Authentication scheme carried in HELLO (v4 and below) or LOGON (v5+).
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "scheme", rename_all = "lowercase")]
pub enum Auth {
    #[default]
    None,
    Basic {
        principal: String,
        credentials: String,
    },
    Bearer {
        credentials: String,
    },
    Kerberos {
        credentials: String,
    },
}

impl Auth {
    pub fn scheme(&self) -> &'static str {
        match self {
            Auth::None => "none",
            Auth::Basic { .. } => "basic",
            Auth::Bearer { .. } => "bearer",
            Auth::Kerberos { .. } => "kerberos",
        }
    }

    /// Number of map entries this scheme contributes: `scheme` itself plus
    /// the scheme-specific fields.
    pub fn entry_count(&self) -> usize {
        match self {
            Auth::None => 1,
            Auth::Basic { .. } => 3,
            Auth::Bearer { .. } | Auth::Kerberos { .. } => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_tagged_schemes() {
        let a: Auth =
            serde_json::from_str(r#"{"scheme":"basic","principal":"neo","credentials":"pw"}"#)
                .unwrap();
        assert_eq!(a, Auth::Basic { principal: "neo".into(), credentials: "pw".into() });
        assert_eq!(a.scheme(), "basic");
        assert_eq!(a.entry_count(), 3);

        let a: Auth = serde_json::from_str(r#"{"scheme":"none"}"#).unwrap();
        assert_eq!(a, Auth::None);
        assert_eq!(a.entry_count(), 1);

        let a: Auth = serde_json::from_str(r#"{"scheme":"bearer","credentials":"tok"}"#).unwrap();
        assert_eq!(a.scheme(), "bearer");
        assert_eq!(a.entry_count(), 2);
    }
}
