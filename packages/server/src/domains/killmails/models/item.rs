//! Item rows, 1:N with their killmail.
//!
//! Container contents nest one level through `parent_id`. Only leaves
//! carry value; the value calculator walks the reconstructed tree.

use std::collections::HashMap;

use anyhow::Result;
use serde::Serialize;
use sqlx::{FromRow, PgConnection, PgPool};

use crate::common::batch::{insert_many, insert_many_returning_ids, OnConflict};

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct Item {
    pub id: i64,
    pub killmail_id: i64,
    pub parent_id: Option<i64>,
    pub item_type_id: i64,
    pub flag: i32,
    pub quantity_dropped: i64,
    pub quantity_destroyed: i64,
    pub singleton: i32,
}

/// One node of the reconstructed item tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemNode {
    pub item_type_id: i64,
    pub quantity_dropped: i64,
    pub quantity_destroyed: i64,
    pub singleton: i32,
    pub children: Vec<ItemNode>,
}

impl ItemNode {
    pub fn leaf(item_type_id: i64, dropped: i64, destroyed: i64) -> Self {
        Self {
            item_type_id,
            quantity_dropped: dropped,
            quantity_destroyed: destroyed,
            singleton: 0,
            children: Vec::new(),
        }
    }
}

const ITEM_COLUMNS: &[&str] = &[
    "killmail_id",
    "parent_id",
    "item_type_id",
    "flag",
    "quantity_dropped",
    "quantity_destroyed",
    "singleton",
];

struct ChildRow<'a> {
    parent_id: i64,
    item: &'a esi::EsiItem,
}

impl Item {
    /// Insert the item tree inside the ingest transaction: top-level rows
    /// first (returning ids), then container contents bound to their
    /// parents.
    pub async fn insert_tree(
        conn: &mut PgConnection,
        killmail_id: i64,
        items: &[esi::EsiItem],
    ) -> Result<u64> {
        if items.is_empty() {
            return Ok(0);
        }

        let parent_ids = insert_many_returning_ids(
            conn,
            "items",
            ITEM_COLUMNS,
            OnConflict::Error,
            items,
            |b, item| {
                b.push_bind(killmail_id)
                    .push_bind(Option::<i64>::None)
                    .push_bind(item.item_type_id)
                    .push_bind(item.flag)
                    .push_bind(item.quantity_dropped.unwrap_or(0))
                    .push_bind(item.quantity_destroyed.unwrap_or(0))
                    .push_bind(item.singleton);
            },
        )
        .await?;

        let mut children = Vec::new();
        for (item, parent_id) in items.iter().zip(parent_ids.iter()) {
            if let Some(contents) = &item.items {
                for child in contents {
                    children.push(ChildRow {
                        parent_id: *parent_id,
                        item: child,
                    });
                }
            }
        }

        let child_count = insert_many(
            conn,
            "items",
            ITEM_COLUMNS,
            OnConflict::Error,
            &children,
            |b, row| {
                b.push_bind(killmail_id)
                    .push_bind(Some(row.parent_id))
                    .push_bind(row.item.item_type_id)
                    .push_bind(row.item.flag)
                    .push_bind(row.item.quantity_dropped.unwrap_or(0))
                    .push_bind(row.item.quantity_destroyed.unwrap_or(0))
                    .push_bind(row.item.singleton);
            },
        )
        .await?;

        Ok(parent_ids.len() as u64 + child_count)
    }

    pub async fn count_for_killmail(killmail_id: i64, db: &PgPool) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE killmail_id = $1")
            .bind(killmail_id)
            .fetch_one(db)
            .await?;
        Ok(count)
    }

    /// Load and rebuild the item tree for the value calculator.
    pub async fn load_tree(killmail_id: i64, db: &PgPool) -> Result<Vec<ItemNode>> {
        let rows = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, killmail_id, parent_id, item_type_id, flag,
                   quantity_dropped, quantity_destroyed, singleton
            FROM items
            WHERE killmail_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(killmail_id)
        .fetch_all(db)
        .await?;

        let mut children_of: HashMap<i64, Vec<ItemNode>> = HashMap::new();
        for row in rows.iter().filter(|r| r.parent_id.is_some()) {
            children_of
                .entry(row.parent_id.unwrap_or_default())
                .or_default()
                .push(ItemNode {
                    item_type_id: row.item_type_id,
                    quantity_dropped: row.quantity_dropped,
                    quantity_destroyed: row.quantity_destroyed,
                    singleton: row.singleton,
                    children: Vec::new(),
                });
        }

        let tree = rows
            .iter()
            .filter(|r| r.parent_id.is_none())
            .map(|row| ItemNode {
                item_type_id: row.item_type_id,
                quantity_dropped: row.quantity_dropped,
                quantity_destroyed: row.quantity_destroyed,
                singleton: row.singleton,
                children: children_of.remove(&row.id).unwrap_or_default(),
            })
            .collect();

        Ok(tree)
    }
}
