//! Collection queries: filters, ordering and limits.
//!
//! A [`Query`] is evaluated the same way by every store implementation, so
//! the matching and ordering rules live with the type. Documents that lack
//! the order-by field are excluded from ordered results; ties are broken by
//! document path so snapshots are stable.

use std::cmp::Ordering;

use serde_json::Value;

use crate::document::{CollectionPath, Document};

/// A single filter clause.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// The field equals the value.
    Equal {
        /// Field name.
        field: String,
        /// Expected value.
        value: Value,
    },
    /// The field is an array containing the value.
    ArrayContains {
        /// Field name.
        field: String,
        /// Element that must be present.
        value: Value,
    },
}

impl Filter {
    /// Returns `true` if `doc` satisfies this clause.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::Equal { field, value } => doc.get(field) == Some(value),
            Self::ArrayContains { field, value } => doc
                .get(field)
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(value)),
        }
    }
}

/// Sort direction for an order-by clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// Ordering clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    /// Field to sort on.
    pub field: String,
    /// Sort direction.
    pub direction: Direction,
}

/// A query over the documents directly inside one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Collection to read from.
    pub collection: CollectionPath,
    /// All clauses must match.
    pub filters: Vec<Filter>,
    /// Optional ordering.
    pub order_by: Option<OrderBy>,
    /// Optional maximum number of results.
    pub limit: Option<usize>,
}

impl Query {
    /// Creates an unfiltered, unordered query over `collection`.
    #[must_use]
    pub const fn new(collection: CollectionPath) -> Self {
        Self {
            collection,
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    /// Adds an equality clause.
    #[must_use]
    pub fn where_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Equal {
            field: field.to_string(),
            value: value.into(),
        });
        self
    }

    /// Adds an array-contains clause.
    #[must_use]
    pub fn array_contains(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::ArrayContains {
            field: field.to_string(),
            value: value.into(),
        });
        self
    }

    /// Sets the ordering.
    #[must_use]
    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.to_string(),
            direction,
        });
        self
    }

    /// Caps the number of results.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns `true` if `doc` lives in the queried collection and passes
    /// every filter. Ordering and limit are not considered.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        self.collection.contains(&doc.path)
            && self.filters.iter().all(|filter| filter.matches(doc))
            && self
                .order_by
                .as_ref()
                .is_none_or(|order| doc.get(&order.field).is_some_and(|v| !v.is_null()))
    }

    /// Filters, orders and limits `docs` into a result set.
    #[must_use]
    pub fn apply(&self, docs: impl IntoIterator<Item = Document>) -> Vec<Document> {
        let mut results: Vec<Document> = docs.into_iter().filter(|doc| self.matches(doc)).collect();

        match &self.order_by {
            Some(order) => results.sort_by(|a, b| {
                let by_field = compare_values(a.get(&order.field), b.get(&order.field));
                let by_field = match order.direction {
                    Direction::Ascending => by_field,
                    Direction::Descending => by_field.reverse(),
                };
                by_field.then_with(|| a.path.cmp(&b.path))
            }),
            None => results.sort_by(|a, b| a.path.cmp(&b.path)),
        }

        if let Some(limit) = self.limit {
            results.truncate(limit);
        }
        results
    }
}

/// Total order over field values: missing < null < bool < number < string < other.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(Value::Array(_) | Value::Object(_)) => 5,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or_default();
            let y = y.as_f64().unwrap_or_default();
            x.total_cmp(&y)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
