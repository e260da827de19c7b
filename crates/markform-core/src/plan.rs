// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The execution planner (C5, §4.4). Pure derivation from the immutable
//! schema: order levels run strictly sequentially; within a level, items
//! sharing a `parallelBatch` string may run concurrently.

use std::collections::BTreeMap;

use crate::model::ParsedForm;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemType {
    Field,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanItem {
    pub item_type: ItemType,
    pub item_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ParallelBatch {
    pub batch_id: String,
    pub items: Vec<PlanItem>,
}

#[derive(Debug, Clone, Default)]
pub struct OrderLevelPlan {
    pub order: i64,
    pub loose_serial: Vec<PlanItem>,
    pub parallel_batches: Vec<ParallelBatch>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    pub order_levels: Vec<OrderLevelPlan>,
}

impl ExecutionPlan {
    pub fn order_level_values(&self) -> Vec<i64> {
        self.order_levels.iter().map(|l| l.order).collect()
    }
}

/// Compute order levels and parallel batches from field ordering (§4.4).
/// Fields with no explicit `order` take 0; the plan is recomputed fresh each
/// time since the schema never mutates within a fill.
pub fn plan(form: &ParsedForm) -> ExecutionPlan {
    let mut by_order: BTreeMap<i64, (Vec<PlanItem>, BTreeMap<String, Vec<PlanItem>>)> = BTreeMap::new();

    for field in form.all_fields() {
        let entry = by_order.entry(field.order).or_default();
        let item = PlanItem { item_type: ItemType::Field, item_id: field.id.clone() };
        match &field.parallel_batch {
            Some(batch_id) => entry.1.entry(batch_id.clone()).or_default().push(item),
            None => entry.0.push(item),
        }
    }

    let order_levels = by_order
        .into_iter()
        .map(|(order, (loose_serial, batches))| OrderLevelPlan {
            order,
            loose_serial,
            parallel_batches: batches
                .into_iter()
                .map(|(batch_id, items)| ParallelBatch { batch_id, items })
                .collect(),
        })
        .collect();

    ExecutionPlan { order_levels }
}
