//! `SimpleMasterDataQuery`: vocabulary lookup, poll only

use super::parameters::{count, flag, invalid};
use super::EpcisQuery;
use crate::error::{EpcisError, Result};
use crate::model::{QueryParameter, QueryResults};
use crate::storage::subscription_store::PendingScope;
use crate::storage::MasterDataQuery;
use rusqlite::Connection;

pub struct SimpleMasterDataQuery;

#[derive(Debug)]
struct MasterDataQueryPlan {
    query: MasterDataQuery,
    max_element_count: Option<usize>,
}

impl MasterDataQueryPlan {
    fn build(parameters: &[QueryParameter]) -> Result<Self> {
        let mut query = MasterDataQuery::new();
        let mut include_attributes = None;
        let mut include_children = None;
        let mut max_element_count = None;

        for parameter in parameters {
            let values = parameter.values.clone();
            match parameter.name.as_str() {
                "vocabularyName" => {
                    query.where_type_in(values);
                }
                "includeAttributes" => include_attributes = Some(flag(parameter)?),
                "includeChildren" => include_children = Some(flag(parameter)?),
                "attributeNames" => {
                    query.restrict_attributes(values);
                }
                "EQ_name" => {
                    query.where_id_in(values);
                }
                "WD_name" => {
                    query.where_within(values);
                }
                "HASATTR" => {
                    query.where_has_attribute(values);
                }
                "maxElementCount" => max_element_count = Some(count(parameter)?),
                name => match name.strip_prefix("EQATTR_") {
                    Some(attribute) if !attribute.is_empty() => {
                        query.where_attribute_in(attribute, values);
                    }
                    _ => return Err(invalid(parameter, "unknown parameter")),
                },
            }
        }

        let (Some(include_attributes), Some(include_children)) = (include_attributes, include_children)
        else {
            return Err(EpcisError::QueryParameter(
                "includeAttributes and includeChildren are required".to_string(),
            ));
        };

        query
            .include_attributes(include_attributes)
            .include_children(include_children);
        if let Some(max) = max_element_count {
            let limit = max.checked_add(1).ok_or_else(|| {
                EpcisError::QueryParameter("maxElementCount is out of range".to_string())
            })?;
            query.set_limit(limit);
        }

        Ok(Self {
            query,
            max_element_count,
        })
    }
}

impl EpcisQuery for SimpleMasterDataQuery {
    fn name(&self) -> &'static str {
        "SimpleMasterDataQuery"
    }

    fn allow_subscription(&self) -> bool {
        false
    }

    fn validate_parameters(&self, parameters: &[QueryParameter]) -> Result<()> {
        MasterDataQueryPlan::build(parameters).map(|_| ())
    }

    /// Master data is never subscribed to, so `pending` is ignored
    fn execute(
        &self,
        conn: &Connection,
        parameters: &[QueryParameter],
        _pending: Option<PendingScope>,
    ) -> Result<QueryResults> {
        let plan = MasterDataQueryPlan::build(parameters)?;
        let elements = plan.query.fetch(conn)?;

        if let Some(max) = plan.max_element_count {
            if elements.len() > max {
                return Err(EpcisError::QueryTooLarge(format!(
                    "more than {} master data elements match the query",
                    max
                )));
            }
        }

        Ok(QueryResults::MasterData(elements))
    }
}
