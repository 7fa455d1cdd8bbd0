use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Instant;

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::field::Field;
use crate::table::Table;
use crate::value::Value;

/// One selected output column, plain or aggregated.
///
/// `field` names a table column, or `*` for `count`. With an `aggr_func`
/// the expression computes that aggregate per group; without one it echoes
/// the group key of the named column, which therefore must appear in the
/// query's group by clause.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectExpr {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggr_func: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggr_func_args: Vec<String>,
}

impl SelectExpr {
    /// A plain column reference.
    pub fn column(field: impl Into<String>) -> Self {
        SelectExpr {
            field: field.into(),
            display: None,
            aggr_func: None,
            aggr_func_args: Vec::new(),
        }
    }

    /// An aggregate over `field`, e.g. `aggregate("count", "*")`.
    pub fn aggregate(func: impl Into<String>, field: impl Into<String>) -> Self {
        SelectExpr {
            field: field.into(),
            display: None,
            aggr_func: Some(func.into()),
            aggr_func_args: Vec::new(),
        }
    }

    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.aggr_func_args = args;
        self
    }

    pub fn is_aggregation(&self) -> bool {
        self.aggr_func.is_some()
    }

    /// Name this column answers to in group by and order by clauses:
    /// the display alias if set, otherwise `func(field)` for aggregates,
    /// otherwise the field name itself.
    pub fn output_name(&self) -> String {
        if let Some(display) = &self.display {
            return display.clone();
        }
        match &self.aggr_func {
            Some(func) => format!("{}({})", func, self.field),
            None => self.field.clone(),
        }
    }
}

/// `field operator value` predicate; only `=` is understood today.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterExpr {
    pub field: String,
    pub operator: String,
    pub value: String,
}

impl FilterExpr {
    pub fn eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        FilterExpr {
            field: field.into(),
            operator: "=".to_string(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupByExpr {
    pub field: String,
}

impl GroupByExpr {
    pub fn new(field: impl Into<String>) -> Self {
        GroupByExpr {
            field: field.into(),
        }
    }
}

/// Sort key; `asc` defaults to false, so an order clause that does not say
/// otherwise sorts descending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderByExpr {
    pub field: String,
    #[serde(default)]
    pub asc: bool,
}

impl OrderByExpr {
    pub fn asc(field: impl Into<String>) -> Self {
        OrderByExpr {
            field: field.into(),
            asc: true,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        OrderByExpr {
            field: field.into(),
            asc: false,
        }
    }
}

/// One leaf of the group expansion: the chain of group key values that
/// identifies it plus the rows it covers.
///
/// The bitmap is owned. Every child is built from a fresh intersection, so
/// groups never alias dictionary bitmaps or each other.
#[derive(Debug, Clone)]
pub struct AggregationGroup {
    keys: Vec<String>,
    value_map: BTreeMap<String, String>,
    bitmap: RoaringBitmap,
}

impl AggregationGroup {
    fn root(bitmap: RoaringBitmap) -> Self {
        AggregationGroup {
            keys: Vec::new(),
            value_map: BTreeMap::new(),
            bitmap,
        }
    }

    /// Extends this group by one grouping level. `bitmap` must already be
    /// the intersection of this group's rows with the key's rows.
    fn child(&self, group_field: &str, key: String, bitmap: RoaringBitmap) -> Self {
        let mut keys = self.keys.clone();
        keys.push(key.clone());
        let mut value_map = self.value_map.clone();
        value_map.insert(group_field.to_string(), key);
        AggregationGroup {
            keys,
            value_map,
            bitmap,
        }
    }

    /// Group key values in group by clause order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Key value this group carries for one grouping field, if grouped by it.
    pub fn key_value(&self, group_field: &str) -> Option<&str> {
        self.value_map.get(group_field).map(String::as_str)
    }

    pub fn bitmap(&self) -> &RoaringBitmap {
        &self.bitmap
    }

    /// Number of rows in the group.
    pub fn cardinality(&self) -> u64 {
        self.bitmap.len()
    }
}

/// Wall-clock time spent in each pipeline stage. The millisecond figures
/// are the microsecond figures divided by 1000, kept for callers that want
/// coarse numbers without doing the division.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryStats {
    pub filter_us: u64,
    pub filter_ms: u64,
    pub group_us: u64,
    pub group_ms: u64,
    pub order_us: u64,
    pub order_ms: u64,
}

/// Result of a finished query.
#[derive(Debug)]
pub struct QueryOutput {
    /// One row per surviving group, columns in select clause order.
    pub rows: Vec<Vec<Value>>,
    /// Leaf group count before the limit was applied.
    pub groups: usize,
    pub stats: QueryStats,
}

/// How one group by level expands a parent group.
enum Grouping<'q> {
    /// Split by the distinct values of a dict-encoded column.
    Column { name: &'q str, field: &'q Field },
    /// Split by a grouping function from the select clause, currently
    /// `dateSecondsGroup` over a timestamp column.
    Derived {
        name: &'q str,
        field: &'q Field,
        func: &'q str,
        args: &'q [String],
    },
}

impl<'q> Grouping<'q> {
    /// Name under which this level's key is recorded in each group.
    fn field_name(&self) -> &'q str {
        match self {
            Grouping::Column { name, .. } => name,
            Grouping::Derived { name, .. } => name,
        }
    }

    fn expand(&self, parent: &RoaringBitmap) -> Result<BTreeMap<String, RoaringBitmap>, CoreError> {
        match self {
            Grouping::Column { field, .. } => field.gen_groups(Some(parent)),
            Grouping::Derived {
                field, func, args, ..
            } => field.gen_groups_fn(parent, func, args),
        }
    }
}

/// A single query against one table, built up with the `select`, `filter`,
/// `group_by` and `order_by` methods and executed with [`Query::run`].
///
/// The pipeline is filter, then group expansion, then per-group row
/// generation, then order and limit. Filtering intersects the full row
/// universe with one dictionary bitmap per predicate; a predicate whose
/// literal is absent from its dictionary empties the universe immediately.
/// Multi-level group bys expand breadth first: each level splits every
/// group of the previous level, and only the final level's groups produce
/// rows.
pub struct Query<'a> {
    table: &'a Table,
    select: Vec<SelectExpr>,
    filters: Vec<FilterExpr>,
    group_by: Vec<GroupByExpr>,
    order_by: Vec<OrderByExpr>,
    limit: i64,
    debug: bool,
    aggregation: bool,
}

impl<'a> Query<'a> {
    pub fn new(table: &'a Table) -> Self {
        Query {
            table,
            select: Vec::new(),
            filters: Vec::new(),
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: -1,
            debug: false,
            aggregation: true,
        }
    }

    pub fn select(mut self, expr: SelectExpr) -> Self {
        self.select.push(expr);
        self
    }

    pub fn selects(mut self, exprs: Vec<SelectExpr>) -> Self {
        self.select.extend(exprs);
        self
    }

    pub fn filter(mut self, expr: FilterExpr) -> Self {
        self.filters.push(expr);
        self
    }

    pub fn filters(mut self, exprs: Vec<FilterExpr>) -> Self {
        self.filters.extend(exprs);
        self
    }

    pub fn group_by(mut self, expr: GroupByExpr) -> Self {
        self.group_by.push(expr);
        self
    }

    pub fn group_bys(mut self, exprs: Vec<GroupByExpr>) -> Self {
        self.group_by.extend(exprs);
        self
    }

    pub fn order_by(mut self, expr: OrderByExpr) -> Self {
        self.order_by.push(expr);
        self
    }

    pub fn order_bys(mut self, exprs: Vec<OrderByExpr>) -> Self {
        self.order_by.extend(exprs);
        self
    }

    /// Row cap applied after ordering; negative means unbounded.
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Turning aggregation off is reserved for raw row scans, which are
    /// not implemented; such a query fails at row generation.
    pub fn with_aggregation(mut self, aggregation: bool) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Executes the query. The table is only read; a query never observes
    /// a partially inserted row because inserts advance the table size
    /// after all columns are written.
    pub fn run(self) -> Result<QueryOutput, CoreError> {
        let mut stats = QueryStats::default();

        let mut universe = RoaringBitmap::new();
        if self.table.size() > 0 {
            universe.insert_range(1..=self.table.size());
        }

        let started = Instant::now();
        self.apply_filters(&mut universe)?;
        stats.filter_us = started.elapsed().as_micros() as u64;
        stats.filter_ms = stats.filter_us / 1000;

        let started = Instant::now();
        let groups = self.expand_groups(universe)?;
        let mut rows = self.gen_result_rows(&groups)?;
        stats.group_us = started.elapsed().as_micros() as u64;
        stats.group_ms = stats.group_us / 1000;

        let started = Instant::now();
        self.apply_order(&mut rows)?;
        if self.limit >= 0 {
            rows.truncate(self.limit as usize);
        }
        stats.order_us = started.elapsed().as_micros() as u64;
        stats.order_ms = stats.order_us / 1000;

        if self.debug {
            tracing::debug!(
                table = self.table.name(),
                groups = groups.len(),
                rows = rows.len(),
                filter_us = stats.filter_us,
                group_us = stats.group_us,
                order_us = stats.order_us,
                "query finished"
            );
        }

        Ok(QueryOutput {
            rows,
            groups: groups.len(),
            stats,
        })
    }

    fn lookup_field(&self, name: &str) -> Result<&'a Field, CoreError> {
        self.table.field(name).ok_or_else(|| {
            CoreError::NotFound(format!(
                "field '{name}' in table '{}'",
                self.table.name()
            ))
        })
    }

    /// Narrows `universe` with every filter in turn. A literal absent from
    /// its dictionary proves the conjunction empty, so the loop clears the
    /// universe and stops early.
    fn apply_filters(&self, universe: &mut RoaringBitmap) -> Result<(), CoreError> {
        for filter in &self.filters {
            let field = self.lookup_field(&filter.field)?;
            match field.get_bitmap(&filter.operator, &filter.value)? {
                Some(bitmap) => *universe &= bitmap,
                None => {
                    universe.clear();
                    break;
                }
            }
        }
        Ok(())
    }

    /// Expands the group by clause level by level. The frontier starts as
    /// one root group over the filtered universe and is replaced wholesale
    /// at each level, so every leaf carries one key per level. No group by
    /// clause means no groups and therefore no rows.
    fn expand_groups(&self, universe: RoaringBitmap) -> Result<Vec<AggregationGroup>, CoreError> {
        if self.group_by.is_empty() {
            return Ok(Vec::new());
        }
        let mut frontier = vec![AggregationGroup::root(universe)];
        for level in &self.group_by {
            let grouping = self.resolve_grouping(&level.field)?;
            let mut next = Vec::new();
            for parent in &frontier {
                for (key, bitmap) in grouping.expand(parent.bitmap())? {
                    next.push(parent.child(grouping.field_name(), key, bitmap));
                }
            }
            frontier = next;
        }
        Ok(frontier)
    }

    /// A group by field is either a table column or the output name of a
    /// select expression carrying a grouping function.
    fn resolve_grouping<'q>(&'q self, name: &'q str) -> Result<Grouping<'q>, CoreError> {
        if let Some(field) = self.table.field(name) {
            return Ok(Grouping::Column { name, field });
        }
        for sel in &self.select {
            let Some(func) = sel.aggr_func.as_deref() else {
                continue;
            };
            if sel.output_name() == name {
                let field = self.lookup_field(&sel.field)?;
                return Ok(Grouping::Derived {
                    name,
                    field,
                    func,
                    args: &sel.aggr_func_args,
                });
            }
        }
        Err(CoreError::NotFound(format!(
            "group by field '{name}' in table '{}'",
            self.table.name()
        )))
    }

    fn gen_result_rows(
        &self,
        groups: &[AggregationGroup],
    ) -> Result<Vec<Vec<Value>>, CoreError> {
        if !self.aggregation {
            return Err(CoreError::UnsupportedQueryShape(
                "non-aggregated row scans are not implemented".to_string(),
            ));
        }
        let mut rows = Vec::with_capacity(groups.len());
        for group in groups {
            let mut row = Vec::with_capacity(self.select.len());
            for sel in &self.select {
                row.push(self.eval_select(sel, group)?);
            }
            rows.push(row);
        }
        Ok(rows)
    }

    fn eval_select(
        &self,
        sel: &SelectExpr,
        group: &AggregationGroup,
    ) -> Result<Value, CoreError> {
        let Some(func) = sel.aggr_func.as_deref() else {
            // A bare column only has a defined value when the query grouped
            // by it, in which case it is the group key.
            return match group.key_value(&sel.field) {
                Some(key) => Ok(Value::Str(key.to_string())),
                None => Err(CoreError::NotFound(format!(
                    "select field '{}' is neither aggregated nor grouped",
                    sel.field
                ))),
            };
        };
        match func {
            "count" => {
                if sel.field != "*" {
                    return Err(CoreError::InvalidArgument(format!(
                        "count only supports '*', got '{}'",
                        sel.field
                    )));
                }
                Ok(Value::BigInt(group.cardinality()))
            }
            "min" => {
                let field = self.lookup_field(&sel.field)?;
                Ok(Value::Int(field.aggr_min(group.bitmap())?))
            }
            "max" => {
                let field = self.lookup_field(&sel.field)?;
                Ok(Value::Int(field.aggr_max(group.bitmap())?))
            }
            "sum" => {
                let field = self.lookup_field(&sel.field)?;
                Ok(Value::BigInt(field.aggr_sum(group.bitmap())?))
            }
            "avg" | "mean" => {
                let field = self.lookup_field(&sel.field)?;
                let sum = field.aggr_sum(group.bitmap())?;
                let count = group.cardinality();
                if count == 0 {
                    return Err(CoreError::DivisionByZero(format!(
                        "avg of field '{}' over an empty group",
                        sel.field
                    )));
                }
                Ok(Value::BigInt(sum / count))
            }
            "dateSecondsGroup" => {
                // The bucket was computed during grouping; here it is just
                // echoed back as this group's key.
                let name = sel.output_name();
                match group.key_value(&name) {
                    Some(key) => Ok(Value::Str(key.to_string())),
                    None => Err(CoreError::NotFound(format!(
                        "derived select '{name}' does not appear in the group by clause"
                    ))),
                }
            }
            other => Err(CoreError::UnknownAggregateFunction(format!("'{other}'"))),
        }
    }

    /// Stable multi-key sort. Order fields must name selected columns, and
    /// each ordered column must hold one orderable value variant across all
    /// rows; both are checked up front so the comparator itself is total.
    fn apply_order(&self, rows: &mut [Vec<Value>]) -> Result<(), CoreError> {
        if self.order_by.is_empty() || rows.is_empty() {
            return Ok(());
        }
        let mut keys = Vec::with_capacity(self.order_by.len());
        for order in &self.order_by {
            let idx = self
                .select
                .iter()
                .position(|s| s.field == order.field || s.output_name() == order.field)
                .ok_or_else(|| {
                    CoreError::UnknownOrderField(format!(
                        "'{}' does not name a selected column",
                        order.field
                    ))
                })?;
            keys.push((idx, order.asc));
        }
        for &(idx, _) in &keys {
            let first = &rows[0][idx];
            for row in rows.iter() {
                if !comparable(first, &row[idx]) {
                    let name = self.select[idx].output_name();
                    let msg = if first.type_name() == row[idx].type_name() {
                        format!(
                            "column '{name}' holds unorderable {} values",
                            first.type_name()
                        )
                    } else {
                        format!(
                            "column '{name}' mixes {} and {} values",
                            first.type_name(),
                            row[idx].type_name()
                        )
                    };
                    return Err(CoreError::UnsupportedOrderValueType(msg));
                }
            }
        }
        rows.sort_by(|a, b| {
            for &(idx, asc) in &keys {
                let ord = compare_values(&a[idx], &b[idx]);
                if ord != Ordering::Equal {
                    return if asc { ord } else { ord.reverse() };
                }
            }
            Ordering::Equal
        });
        Ok(())
    }
}

fn comparable(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Int(_), Value::Int(_))
            | (Value::BigInt(_), Value::BigInt(_))
            | (Value::Str(_), Value::Str(_))
    )
}

/// Compares two values of the same variant; pairs that `comparable` would
/// reject collapse to `Equal` to keep the ordering total.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::BigInt(x), Value::BigInt(y)) => x.cmp(y),
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}
