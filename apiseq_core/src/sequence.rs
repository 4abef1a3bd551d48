use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one resource within a single sequence.
#[derive(
    Serialize, Deserialize, Encode, Decode, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct ResourceId(pub u32);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// What a single argument position of a call is bound to.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum Binding {
    Resource {
        id: ResourceId,
    },
    /// A deliberately stale handle, legal only in a negative-case call.
    Stale {
        id: ResourceId,
    },
    Null,
    /// A rendered C expression.
    Literal {
        text: String,
    },
    /// A local byte array declared by the emitter.
    Buffer {
        slot: u32,
        len: u32,
    },
    BufferLen {
        slot: u32,
    },
    /// Address of a length local initialized from buffer `buffer`.
    LenRef {
        slot: u32,
        buffer: u32,
    },
    /// Address of a local receiving an output value.
    Out {
        slot: u32,
    },
}

impl Binding {
    pub fn resource(&self) -> Option<ResourceId> {
        match self {
            Binding::Resource { id } | Binding::Stale { id } => Some(*id),
            _ => None,
        }
    }
}

/// One committed (or proposed) call of an API.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    pub api: String,
    pub bindings: Vec<Binding>,
    /// Ids produced by this call: `ResourceOut` params in order, then the returned handle.
    #[serde(default)]
    pub produces: Vec<ResourceId>,
    /// Slot receiving a status or value return.
    #[serde(default)]
    pub capture: Option<u32>,
    #[serde(default)]
    pub negative: bool,
}

impl CallSite {
    pub fn new(api: impl Into<String>) -> Self {
        Self {
            api: api.into(),
            bindings: Vec::new(),
            produces: Vec::new(),
            capture: None,
            negative: false,
        }
    }
}

#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Termination {
    /// Every owned resource reached `Freed`.
    #[default]
    Cleaned,
    /// Resources were intentionally left alive.
    Leaked,
}

/// A resource that appears in a sequence, in creation order.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct ResourceDecl {
    pub id: ResourceId,
    pub class: String,
}

/// A finished, immutable call sequence.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    pub id: u64,
    pub library: String,
    pub seed: u64,
    pub calls: Vec<CallSite>,
    pub resources: Vec<ResourceDecl>,
    /// Index of the first call appended by the cleanup pass.
    pub cleanup_start: usize,
    pub termination: Termination,
}

impl Sequence {
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Distinct API names in order of first use.
    pub fn distinct_apis(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for call in &self.calls {
            if !seen.contains(&call.api.as_str()) {
                seen.push(&call.api);
            }
        }
        seen
    }

    /// Consecutive API 3-grams.
    pub fn api_triples(&self) -> Vec<[String; 3]> {
        self.calls
            .windows(3)
            .map(|w| [w[0].api.clone(), w[1].api.clone(), w[2].api.clone()])
            .collect()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Sequence {
        let mut create = CallSite::new("widget_create");
        create.produces.push(ResourceId(0));
        let mut free = CallSite::new("widget_free");
        free.bindings.push(Binding::Resource { id: ResourceId(0) });
        let mut again = CallSite::new("widget_create");
        again.produces.push(ResourceId(1));
        Sequence {
            id: 7,
            library: "widget".to_string(),
            seed: 42,
            calls: vec![create, free, again],
            resources: vec![
                ResourceDecl { id: ResourceId(0), class: "Widget".to_string() },
                ResourceDecl { id: ResourceId(1), class: "Widget".to_string() },
            ],
            cleanup_start: 3,
            termination: Termination::Leaked,
        }
    }

    #[test]
    fn distinct_apis_keep_first_use_order() {
        assert_eq!(sample().distinct_apis(), vec!["widget_create", "widget_free"]);
    }

    #[test]
    fn triples_slide_over_calls() {
        let triples = sample().api_triples();
        assert_eq!(triples.len(), 1);
        assert_eq!(triples[0][1], "widget_free");
    }

    #[test]
    fn json_form_is_tagged_and_parses_back() {
        let seq = sample();
        let json = seq.to_json().unwrap();
        assert!(json.contains("\"kind\": \"resource\""), "json was: {}", json);
        assert!(json.contains("\"termination\": \"leaked\""));
        assert_eq!(Sequence::from_json(&json).unwrap(), seq);
    }

    #[test]
    fn resource_id_displays_with_prefix() {
        assert_eq!(ResourceId(12).to_string(), "r12");
    }
}
