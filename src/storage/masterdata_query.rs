//! Vocabulary element filter and two-phase fetch
//!
//! Master data is append-only, so the same `(type, id)` can be captured many
//! times. Every read here only sees the latest capture of an element.

use super::event_query::{descendants_sql, placeholders, CompiledQuery};
use super::{key_pairs, text, MAX_BOUND_PARAMETERS};
use crate::model::{MasterData, MasterDataAttribute};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::collections::HashMap;

/// Condition keeping only the newest capture of the element behind `alias`
pub(crate) fn latest_masterdata(alias: &str) -> String {
    format!(
        "NOT EXISTS (SELECT 1 FROM masterdata newer WHERE newer.md_type = {a}.md_type \
         AND newer.md_id = {a}.md_id \
         AND (newer.request_id > {a}.request_id \
         OR (newer.request_id = {a}.request_id AND newer.md_index > {a}.md_index)))",
        a = alias
    )
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MasterDataQuery {
    types: Vec<String>,
    ids: Vec<String>,
    within: Vec<String>,
    has_attributes: Vec<String>,
    attribute_values: Vec<(String, Vec<String>)>,
    include_attributes: bool,
    include_children: bool,
    attribute_names: Option<Vec<String>>,
    limit: Option<usize>,
}

impl MasterDataQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn where_type_in(&mut self, types: Vec<String>) -> &mut Self {
        self.types.extend(types);
        self
    }

    pub fn where_id_in(&mut self, ids: Vec<String>) -> &mut Self {
        self.ids.extend(ids);
        self
    }

    /// Element is one of `ids` or one of their descendants
    pub fn where_within(&mut self, ids: Vec<String>) -> &mut Self {
        self.within.extend(ids);
        self
    }

    pub fn where_has_attribute(&mut self, attributes: Vec<String>) -> &mut Self {
        self.has_attributes.extend(attributes);
        self
    }

    pub fn where_attribute_in(&mut self, attribute: impl Into<String>, values: Vec<String>) -> &mut Self {
        self.attribute_values.push((attribute.into(), values));
        self
    }

    pub fn include_attributes(&mut self, include: bool) -> &mut Self {
        self.include_attributes = include;
        self
    }

    pub fn include_children(&mut self, include: bool) -> &mut Self {
        self.include_children = include;
        self
    }

    /// Only return these attributes; has no effect unless attributes are included
    pub fn restrict_attributes(&mut self, names: Vec<String>) -> &mut Self {
        self.attribute_names = Some(names);
        self
    }

    /// `0` means unbounded
    pub fn set_limit(&mut self, limit: usize) -> &mut Self {
        self.limit = (limit > 0).then_some(limit);
        self
    }

    pub fn compile(&self) -> CompiledQuery {
        let mut params = Vec::new();
        let mut conditions = vec![latest_masterdata("m")];

        if !self.types.is_empty() {
            params.extend(self.types.iter().map(|t| text(t)));
            conditions.push(format!("m.md_type IN ({})", placeholders(self.types.len())));
        }
        if !self.ids.is_empty() {
            params.extend(self.ids.iter().map(|id| text(id)));
            conditions.push(format!("m.md_id IN ({})", placeholders(self.ids.len())));
        }
        if !self.within.is_empty() {
            conditions.push(format!(
                "m.md_id IN ({})",
                descendants_sql(None, &self.within, &mut params)
            ));
        }
        if !self.has_attributes.is_empty() {
            params.extend(self.has_attributes.iter().map(|a| text(a)));
            conditions.push(format!(
                "EXISTS (SELECT 1 FROM masterdata_attribute a \
                 WHERE a.request_id = m.request_id AND a.md_index = m.md_index \
                 AND a.attribute_id IN ({}))",
                placeholders(self.has_attributes.len())
            ));
        }
        for (attribute, values) in &self.attribute_values {
            params.push(text(attribute));
            params.extend(values.iter().map(|v| text(v)));
            conditions.push(format!(
                "EXISTS (SELECT 1 FROM masterdata_attribute a \
                 WHERE a.request_id = m.request_id AND a.md_index = m.md_index \
                 AND a.attribute_id = ? AND a.value IN ({}))",
                placeholders(values.len())
            ));
        }

        params.push(Value::Integer(
            self.limit
                .and_then(|l| i64::try_from(l).ok())
                .unwrap_or(i64::MAX),
        ));

        CompiledQuery {
            sql: format!(
                "SELECT m.request_id, m.md_index, m.md_type, m.md_id FROM masterdata m \
                 WHERE {} ORDER BY m.md_type, m.md_id LIMIT ?",
                conditions.join(" AND ")
            ),
            params,
        }
    }

    pub fn fetch(&self, conn: &Connection) -> rusqlite::Result<Vec<MasterData>> {
        let compiled = self.compile();

        let mut stmt = conn.prepare(&compiled.sql)?;
        let rows = stmt
            .query_map(params_from_iter(compiled.params.iter()), |row| {
                Ok((
                    (row.get::<_, i64>(0)?, row.get::<_, i64>(1)?),
                    MasterData::new(row.get::<_, String>(2)?, row.get::<_, String>(3)?),
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let keys: Vec<(i64, i64)> = rows.iter().map(|(key, _)| *key).collect();
        let positions: HashMap<(i64, i64), usize> =
            keys.iter().enumerate().map(|(position, key)| (*key, position)).collect();
        let mut elements: Vec<MasterData> = rows.into_iter().map(|(_, element)| element).collect();

        if elements.is_empty() || !(self.include_attributes || self.include_children) {
            return Ok(elements);
        }

        for chunk in keys.chunks(MAX_BOUND_PARAMETERS / 2) {
            if self.include_attributes {
                self.attach_attributes(conn, chunk, &positions, &mut elements)?;
            }
            if self.include_children {
                attach_children(conn, chunk, &positions, &mut elements)?;
            }
        }

        Ok(elements)
    }

    fn attach_attributes(
        &self,
        conn: &Connection,
        keys: &[(i64, i64)],
        positions: &HashMap<(i64, i64), usize>,
        elements: &mut [MasterData],
    ) -> rusqlite::Result<()> {
        let mut params = Vec::with_capacity(keys.len() * 2);
        let mut sql = format!(
            "SELECT request_id, md_index, attribute_id, value FROM masterdata_attribute \
             WHERE (request_id, md_index) IN (VALUES {})",
            key_pairs(keys, &mut params)
        );
        if let Some(names) = &self.attribute_names {
            params.extend(names.iter().map(|n| text(n)));
            sql.push_str(&format!(" AND attribute_id IN ({})", placeholders(names.len())));
        }
        sql.push_str(" ORDER BY request_id, md_index, attribute_index");

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        while let Some(row) = rows.next()? {
            let key = (row.get(0)?, row.get(1)?);
            if let Some(&position) = positions.get(&key) {
                elements[position].attributes.push(MasterDataAttribute {
                    id: row.get(2)?,
                    value: row.get(3)?,
                });
            }
        }
        Ok(())
    }
}

fn attach_children(
    conn: &Connection,
    keys: &[(i64, i64)],
    positions: &HashMap<(i64, i64), usize>,
    elements: &mut [MasterData],
) -> rusqlite::Result<()> {
    let mut params = Vec::with_capacity(keys.len() * 2);
    let sql = format!(
        "SELECT request_id, md_index, child_id FROM masterdata_hierarchy \
         WHERE (request_id, md_index) IN (VALUES {}) \
         ORDER BY request_id, md_index, child_index",
        key_pairs(keys, &mut params)
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    while let Some(row) = rows.next()? {
        let key = (row.get(0)?, row.get(1)?);
        if let Some(&position) = positions.get(&key) {
            elements[position].children.push(row.get(2)?);
        }
    }
    Ok(())
}
