//! Candidate reference covers

use serde::{Deserialize, Serialize};

/// One reference cover image
///
/// Either `image` bytes, a `url` to fetch them from, or both must be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Image bytes, base64 in JSON
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::utils::base64_bytes::option"
    )]
    pub image: Option<Vec<u8>>,
}

impl Candidate {
    pub fn from_bytes(id: impl Into<String>, image: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            url: None,
            image: Some(image),
        }
    }

    pub fn from_url(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: Some(url.into()),
            image: None,
        }
    }

    pub fn is_resolvable(&self) -> bool {
        self.image.is_some() || self.url.is_some()
    }
}

/// Where the candidate set for a session comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidateTarget {
    /// Candidates supplied with the request
    Inline { candidates: Vec<Candidate> },
    /// Series (and optionally one issue) resolved by the host's catalog
    Series {
        series: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        issue_number: Option<String>,
    },
}

impl CandidateTarget {
    /// Short human-readable description for status messages and logs
    pub fn describe(&self) -> String {
        match self {
            CandidateTarget::Inline { candidates } => {
                format!("{} inline candidates", candidates.len())
            }
            CandidateTarget::Series {
                series,
                issue_number: Some(issue),
            } => format!("series {} #{}", series, issue),
            CandidateTarget::Series { series, .. } => format!("series {}", series),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_json_shape() {
        let inline = CandidateTarget::Inline {
            candidates: vec![
                Candidate::from_bytes("c1", vec![1, 2, 3]),
                Candidate::from_url("c2", "https://covers.example/c2.jpg"),
            ],
        };
        let json = serde_json::to_value(&inline).unwrap();
        assert_eq!(json["kind"], "inline");
        assert_eq!(json["candidates"][0]["image"], "AQID");
        assert!(json["candidates"][1].get("image").is_none());

        let back: CandidateTarget = serde_json::from_value(json).unwrap();
        assert_eq!(back, inline);
    }

    #[test]
    fn test_series_target() {
        let target: CandidateTarget =
            serde_json::from_str(r#"{"kind":"series","series":"saga","issue_number":"12"}"#)
                .unwrap();
        assert_eq!(target.describe(), "series saga #12");
    }

    #[test]
    fn test_resolvable() {
        let bare = Candidate {
            id: "x".to_string(),
            url: None,
            image: None,
        };
        assert!(!bare.is_resolvable());
        assert!(Candidate::from_url("y", "u").is_resolvable());
    }
}
