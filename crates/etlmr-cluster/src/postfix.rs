//! Post-fix pass: duplicate resolution and foreign-key rewrite across a
//! snowflake, run after ODAT dimension load. Ported from
//! `pyetlmr.postfix`.

use std::collections::HashMap;

use etlmr_core::config::ReferenceSpec;
use etlmr_core::error::{EtlError, Result};

/// One table (dimension) in the snowflake being fixed.
pub struct Table {
    pub name: String,
    pub pkey: String,
    /// Attributes whose equal-value groups identify duplicate rows:
    /// the dimension's own business key plus, for non-leaf tables, the
    /// foreign-key attributes of its (already fixed) reference tables.
    pub duplicateattrs: Vec<String>,
    /// `(foreign key attribute on this table, the table it references)`.
    pub reftables: Vec<(String, Table)>,
    pub root: bool,
}

impl Table {
    /// Groups rows by `duplicateattrs`, keeping only groups with more
    /// than one `pkey` value; each returned group is sorted ascending.
    /// Ported from `get_fixedidlist`.
    async fn fixed_id_groups(&self, client: &tokio_postgres::Client) -> Result<Vec<Vec<i64>>> {
        if self.root {
            return Ok(Vec::new());
        }
        let cols = self.duplicateattrs.join(", ");
        // Cast every duplicate-key column to text: `duplicateattrs` mixes
        // the dimension's own (usually text) lookup attributes with
        // integer foreign-key columns from already-fixed reference
        // tables, and `Row::get` panics on a type mismatch rather than
        // erroring, so the column type can't be left to vary.
        let select_cols: Vec<String> = self.duplicateattrs.iter().map(|c| format!("{c}::text")).collect();
        let stmt = format!(
            "SELECT {pkey}, {select_cols} FROM {table} ORDER BY {cols}",
            pkey = self.pkey,
            select_cols = select_cols.join(", "),
            cols = cols,
            table = self.name
        );
        let rows = client.query(&stmt, &[]).await.map_err(|e| EtlError::Other(e.into()))?;
        let mut groups: HashMap<Vec<String>, Vec<i64>> = HashMap::new();
        let mut order: Vec<Vec<String>> = Vec::new();
        for row in &rows {
            let pkey: i64 = row.get(0);
            let dup_key: Vec<String> = (1..row.len()).map(|i| row.get::<_, Option<String>>(i).unwrap_or_default()).collect();
            if !groups.contains_key(&dup_key) {
                order.push(dup_key.clone());
            }
            groups.entry(dup_key).or_default().push(pkey);
        }
        let mut result = Vec::new();
        for key in order {
            let mut ids = groups.remove(&key).unwrap_or_default();
            if ids.len() > 1 {
                ids.sort_unstable();
                result.push(ids);
            }
        }
        Ok(result)
    }

    /// For each duplicate group, collapses every id but the maximum onto
    /// the maximum: `UPDATE t SET fkey = max(ids) WHERE fkey IN
    /// (ids minus the max)`.
    async fn update_foreign_ref(&self, client: &tokio_postgres::Client, fkey: &str, groups: &[Vec<i64>]) -> Result<()> {
        for ids in groups {
            let survivor = *ids.last().expect("duplicate groups are non-empty");
            let stale: Vec<String> = ids[..ids.len() - 1].iter().map(|id| id.to_string()).collect();
            if stale.is_empty() {
                continue;
            }
            let stmt = format!(
                "UPDATE {table} SET {fkey} = {survivor} WHERE {fkey} IN ({stale})",
                table = self.name,
                fkey = fkey,
                survivor = survivor,
                stale = stale.join(", ")
            );
            client.execute(&stmt, &[]).await.map_err(|e| EtlError::Other(e.into()))?;
        }
        Ok(())
    }

    /// Deletes every row except the one with the maximum pkey in each
    /// `duplicateattrs` group.
    async fn delete_duplicate_rows(&self, client: &tokio_postgres::Client) -> Result<()> {
        let cols = self.duplicateattrs.join(", ");
        let stmt = format!(
            "DELETE FROM {table} WHERE {pkey} NOT IN (SELECT MAX({pkey}) FROM {table} GROUP BY {cols})",
            table = self.name,
            pkey = self.pkey,
            cols = cols
        );
        client.execute(&stmt, &[]).await.map_err(|e| EtlError::Other(e.into()))?;
        Ok(())
    }

    /// Recursively fixes reference tables first, rewrites this table's
    /// foreign keys to match, deletes duplicate rows (unless this table
    /// is the snowflake root), and returns this table's own duplicate
    /// id groups for a parent to rewrite against.
    pub async fn fix(&self, client: &tokio_postgres::Client) -> Result<Vec<Vec<i64>>> {
        for (fkey, reftable) in &self.reftables {
            let child_groups = Box::pin(reftable.fix(client)).await?;
            if !child_groups.is_empty() {
                self.update_foreign_ref(client, fkey, &child_groups).await?;
            }
        }
        let own_groups = self.fixed_id_groups(client).await?;
        if !self.root {
            self.delete_duplicate_rows(client).await?;
        }
        Ok(own_groups)
    }
}

/// Builds the snowflake `Table` tree from declared references and
/// dimension metadata, then fixes it, mirroring
/// `postfix.__build_snowflake` + `postfix.post_fix`.
pub struct DimensionMeta {
    pub name: String,
    pub key: String,
    pub lookupatts: Vec<String>,
}

pub fn build_snowflake(
    references: &[ReferenceSpec],
    dims: &HashMap<String, DimensionMeta>,
    root_name: &str,
) -> Result<Table> {
    build_node(root_name, references, dims, root_name)
}

fn build_node(
    name: &str,
    references: &[ReferenceSpec],
    dims: &HashMap<String, DimensionMeta>,
    root_name: &str,
) -> Result<Table> {
    let meta = dims
        .get(name)
        .ok_or_else(|| EtlError::Configuration(format!("post-fix: unknown dimension {name}")))?;
    let children: Vec<&str> = references
        .iter()
        .find(|r| r.parent == name)
        .map(|r| r.children.iter().map(String::as_str).collect())
        .unwrap_or_default();

    let mut duplicateattrs = meta.lookupatts.clone();
    let mut reftables = Vec::new();
    for child in children {
        let child_meta = dims
            .get(child)
            .ok_or_else(|| EtlError::Configuration(format!("post-fix: unknown dimension {child}")))?;
        duplicateattrs.push(child_meta.key.clone());
        let child_table = build_node(child, references, dims, root_name)?;
        reftables.push((child_meta.key.clone(), child_table));
    }

    Ok(Table {
        name: meta.name.clone(),
        pkey: meta.key.clone(),
        duplicateattrs,
        reftables,
        root: name == root_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, key: &str, lookupatts: &[&str]) -> DimensionMeta {
        DimensionMeta { name: name.into(), key: key.into(), lookupatts: lookupatts.iter().map(|s| s.to_string()).collect() }
    }

    #[test]
    fn builds_tree_with_accumulated_duplicate_attrs() {
        let mut dims = HashMap::new();
        dims.insert("pagedim".to_string(), meta("pagedim", "pageid", &["url"]));
        dims.insert("domaindim".to_string(), meta("domaindim", "domainid", &["domain"]));
        let references = vec![ReferenceSpec { parent: "pagedim".into(), children: vec!["domaindim".into()] }];
        let tree = build_snowflake(&references, &dims, "pagedim").unwrap();
        assert!(tree.root);
        assert_eq!(tree.duplicateattrs, vec!["url".to_string(), "domainid".to_string()]);
        assert_eq!(tree.reftables.len(), 1);
        assert!(!tree.reftables[0].1.root);
    }
}
