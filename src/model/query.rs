//! Query parameters, poll requests and poll responses

use super::event::Event;
use super::masterdata::MasterData;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParameter {
    pub name: String,
    pub values: Vec<String>,
}

impl QueryParameter {
    pub fn new(name: impl Into<String>, values: &[&str]) -> Self {
        Self {
            name: name.into(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// Normalize a parameter list
///
/// Parameters sharing a name are merged (first occurrence keeps its position),
/// blank values are dropped and parameters left without values disappear.
/// Applying it twice yields the same list.
pub fn normalize_parameters(parameters: Vec<QueryParameter>) -> Vec<QueryParameter> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<QueryParameter> = Vec::new();

    for parameter in parameters {
        let values = parameter
            .values
            .into_iter()
            .filter(|v| !v.trim().is_empty());

        match positions.get(&parameter.name) {
            Some(&position) => merged[position].values.extend(values),
            None => {
                positions.insert(parameter.name.clone(), merged.len());
                merged.push(QueryParameter {
                    name: parameter.name,
                    values: values.collect(),
                });
            }
        }
    }

    merged.retain(|p| !p.values.is_empty());
    merged
}

/// On-demand execution of a named query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub query_name: String,
    #[serde(default)]
    pub parameters: Vec<QueryParameter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryResults {
    Events(Vec<Event>),
    MasterData(Vec<MasterData>),
}

impl QueryResults {
    pub fn len(&self) -> usize {
        match self {
            QueryResults::Events(events) => events.len(),
            QueryResults::MasterData(elements) => elements.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of a poll, also the payload delivered to subscription destinations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    pub query_name: String,
    pub subscription_id: Option<String>,
    pub results: QueryResults,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_merges_and_drops_blank_values() {
        let parameters = vec![
            QueryParameter::new("EQ_bizStep", &["urn:step:shipping", " "]),
            QueryParameter::new("eventType", &["", "  "]),
            QueryParameter::new("EQ_bizStep", &["urn:step:receiving"]),
            QueryParameter::new("MATCH_epc", &["urn:epc:id:sgtin:1.2.3"]),
        ];

        let normalized = normalize_parameters(parameters);

        assert_eq!(
            normalized,
            vec![
                QueryParameter::new("EQ_bizStep", &["urn:step:shipping", "urn:step:receiving"]),
                QueryParameter::new("MATCH_epc", &["urn:epc:id:sgtin:1.2.3"]),
            ]
        );
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let parameters = vec![
            QueryParameter::new("b", &["1", ""]),
            QueryParameter::new("a", &["x"]),
            QueryParameter::new("b", &["2"]),
        ];

        let once = normalize_parameters(parameters);
        let twice = normalize_parameters(once.clone());

        assert_eq!(once, twice);
    }

    #[test]
    fn test_normalize_empty_list() {
        assert!(normalize_parameters(Vec::new()).is_empty());
    }
}
