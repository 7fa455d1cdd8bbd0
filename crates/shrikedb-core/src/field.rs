use std::collections::BTreeMap;

use roaring::RoaringBitmap;

use crate::error::CoreError;
use crate::value::{FieldEncoding, FieldType, Value};

/// Rough per-string bookkeeping (length, capacity, allocator slack) added on
/// top of payload bytes when estimating memory.
const STRING_ENTRY_OVERHEAD: u64 = 32;

/// Physical storage for one column, selected by type and encoding at
/// construction. Invalid combinations are unrepresentable.
#[derive(Debug)]
enum Storage {
    Timestamps(Vec<i64>),
    Ints(Vec<i32>),
    /// Positions whose appended value was true.
    Bools(RoaringBitmap),
    /// Raw string column, no index.
    Strings(Vec<String>),
    /// Inverted index: distinct value -> bitmap of 1-based row positions.
    Dict(BTreeMap<String, RoaringBitmap>),
}

/// One typed column of a table.
///
/// Rows are identified by 1-based dense positions: an append lands at
/// position `size + 1` and then advances `size`. Vector-backed storage is
/// read back with `values[position - 1]`; bitmaps store the positions
/// directly. Dictionary bitmaps are owned by the field for its whole
/// lifetime and only ever handed out as borrows.
#[derive(Debug)]
pub struct Field {
    name: String,
    field_type: FieldType,
    encoding: FieldEncoding,
    size: u32,
    storage: Storage,
}

impl Field {
    /// Creates an empty column of the given type and encoding.
    pub fn new(
        name: impl Into<String>,
        field_type: FieldType,
        encoding: FieldEncoding,
    ) -> Result<Self, CoreError> {
        let name = name.into();
        let storage = match (field_type, encoding) {
            (FieldType::Timestamp, FieldEncoding::None) => Storage::Timestamps(Vec::new()),
            (FieldType::Int, FieldEncoding::None) => Storage::Ints(Vec::new()),
            (FieldType::Boolean, FieldEncoding::None) => Storage::Bools(RoaringBitmap::new()),
            (FieldType::String, FieldEncoding::None) => Storage::Strings(Vec::new()),
            (FieldType::String, FieldEncoding::Dict) => Storage::Dict(BTreeMap::new()),
            (_, FieldEncoding::Dict) => {
                return Err(CoreError::UnsupportedEncoding(format!(
                    "dict encoding requires a string field, field '{name}' is {field_type}"
                )))
            }
            (_, FieldEncoding::MultiVal) => {
                return Err(CoreError::UnsupportedEncoding(format!(
                    "multi_val encoding is not implemented, requested for field '{name}'"
                )))
            }
        };
        Ok(Field {
            name,
            field_type,
            encoding,
            size: 0,
            storage,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn encoding(&self) -> FieldEncoding {
        self.encoding
    }

    /// Number of appended values.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Appends one value. The value's variant must match the column's
    /// declared type; on success the column grows by exactly one position.
    pub fn add_value(&mut self, value: &Value) -> Result<(), CoreError> {
        let position = self.size + 1;
        match (&mut self.storage, value) {
            (Storage::Timestamps(timestamps), Value::Timestamp(v)) => timestamps.push(*v),
            (Storage::Ints(ivals), Value::Int(v)) => ivals.push(*v),
            (Storage::Bools(bitmap), Value::Bool(v)) => {
                if *v {
                    bitmap.insert(position);
                }
            }
            (Storage::Strings(raw), Value::Str(v)) => raw.push(v.clone()),
            (Storage::Dict(dict), Value::Str(v)) => match dict.get_mut(v.as_str()) {
                Some(bitmap) => {
                    bitmap.insert(position);
                }
                None => {
                    let mut bitmap = RoaringBitmap::new();
                    bitmap.insert(position);
                    dict.insert(v.clone(), bitmap);
                }
            },
            _ => {
                return Err(CoreError::TypeMismatch(format!(
                    "field '{}' is {}, cannot append a {} value",
                    self.name,
                    self.field_type,
                    value.type_name()
                )))
            }
        }
        self.size += 1;
        Ok(())
    }

    /// Resolves the row set matching `operator value` against this column.
    ///
    /// Only `=` over a dict-encoded string column is defined. `Ok(None)`
    /// means the literal does not occur in the dictionary at all; callers
    /// must treat that as an empty row set, not an error.
    pub fn get_bitmap(
        &self,
        operator: &str,
        value: &str,
    ) -> Result<Option<&RoaringBitmap>, CoreError> {
        if operator != "=" {
            return Err(CoreError::UnsupportedOperator(format!(
                "'{operator}' on field '{}', only '=' is supported",
                self.name
            )));
        }
        match &self.storage {
            Storage::Dict(dict) => Ok(dict.get(value)),
            Storage::Strings(_) => Err(CoreError::UnsupportedEncoding(format!(
                "field '{}' is not dict encoded and cannot back a filter",
                self.name
            ))),
            _ => Err(CoreError::UnsupportedFieldType(format!(
                "cannot filter on field '{}' of type {}",
                self.name, self.field_type
            ))),
        }
    }

    /// Splits `initial` by this column's distinct values.
    ///
    /// Each returned bitmap is a fresh intersection, never an alias into the
    /// dictionary; empty intersections are dropped. Without an `initial`
    /// bitmap the whole dictionary is returned, copied.
    pub fn gen_groups(
        &self,
        initial: Option<&RoaringBitmap>,
    ) -> Result<BTreeMap<String, RoaringBitmap>, CoreError> {
        let dict = match &self.storage {
            Storage::Dict(dict) => dict,
            _ => {
                return Err(CoreError::UnsupportedForGroupBy(format!(
                    "field '{}' ({} / {}) has no grouping algorithm",
                    self.name, self.field_type, self.encoding
                )))
            }
        };
        let mut groups = BTreeMap::new();
        for (value, bitmap) in dict {
            let intersected = match initial {
                Some(initial) => initial & bitmap,
                None => bitmap.clone(),
            };
            if intersected.is_empty() {
                continue;
            }
            groups.insert(value.clone(), intersected);
        }
        Ok(groups)
    }

    /// Parametrized grouping; the only implemented function is
    /// `dateSecondsGroup(bucketSeconds)` over a timestamp column.
    ///
    /// Every position in `initial` is bucketed by `ts - ts % bucketSeconds`
    /// (truncating modulo, so the bucket floor follows the timestamp's
    /// sign) and the result is keyed by the bucket's decimal string.
    pub fn gen_groups_fn(
        &self,
        initial: &RoaringBitmap,
        func: &str,
        args: &[String],
    ) -> Result<BTreeMap<String, RoaringBitmap>, CoreError> {
        let timestamps = match &self.storage {
            Storage::Timestamps(timestamps) => timestamps,
            _ => {
                return Err(CoreError::UnsupportedForGroupBy(format!(
                    "field '{}' ({} / {}) cannot be grouped by {func}",
                    self.name, self.field_type, self.encoding
                )))
            }
        };
        if func != "dateSecondsGroup" {
            return Err(CoreError::UnknownAggregateFunction(format!(
                "'{func}' is not a grouping function"
            )));
        }
        let raw = args.first().ok_or_else(|| {
            CoreError::InvalidArgument("dateSecondsGroup needs a bucket seconds argument".to_string())
        })?;
        let seconds: i64 = raw.parse().map_err(|_| {
            CoreError::InvalidArgument(format!(
                "dateSecondsGroup bucket seconds '{raw}' is not an integer"
            ))
        })?;
        if seconds == 0 {
            return Err(CoreError::InvalidArgument(
                "dateSecondsGroup bucket seconds must be nonzero".to_string(),
            ));
        }
        let mut buckets: BTreeMap<i64, RoaringBitmap> = BTreeMap::new();
        for position in initial {
            let ts = timestamps[(position - 1) as usize];
            let bucket = ts - ts % seconds;
            buckets.entry(bucket).or_default().insert(position);
        }
        Ok(buckets
            .into_iter()
            .map(|(bucket, bitmap)| (bucket.to_string(), bitmap))
            .collect())
    }

    /// Minimum int value across `bitmap`; identity `i32::MAX` when empty.
    pub fn aggr_min(&self, bitmap: &RoaringBitmap) -> Result<i32, CoreError> {
        let ivals = self.int_values("min")?;
        let mut min = i32::MAX;
        for position in bitmap {
            let v = ivals[(position - 1) as usize];
            if v < min {
                min = v;
            }
        }
        Ok(min)
    }

    /// Maximum int value across `bitmap`; identity `i32::MIN` when empty.
    pub fn aggr_max(&self, bitmap: &RoaringBitmap) -> Result<i32, CoreError> {
        let ivals = self.int_values("max")?;
        let mut max = i32::MIN;
        for position in bitmap {
            let v = ivals[(position - 1) as usize];
            if v > max {
                max = v;
            }
        }
        Ok(max)
    }

    /// Sum across `bitmap`, folded into a wrapping unsigned 64-bit
    /// accumulator; identity 0 when empty.
    pub fn aggr_sum(&self, bitmap: &RoaringBitmap) -> Result<u64, CoreError> {
        let ivals = self.int_values("sum")?;
        let mut sum: u64 = 0;
        for position in bitmap {
            sum = sum.wrapping_add(ivals[(position - 1) as usize] as u64);
        }
        Ok(sum)
    }

    /// Approximate heap footprint of this column's storage, for diagnostics
    /// only: order of magnitude, monotonically increasing with data volume.
    pub fn stat_used_memory(&self) -> u64 {
        match &self.storage {
            Storage::Timestamps(timestamps) => {
                (timestamps.len() * std::mem::size_of::<i64>()) as u64
            }
            Storage::Ints(ivals) => (ivals.len() * std::mem::size_of::<i32>()) as u64,
            Storage::Bools(bitmap) => bitmap.serialized_size() as u64,
            Storage::Strings(raw) => raw
                .iter()
                .map(|s| s.len() as u64 + STRING_ENTRY_OVERHEAD)
                .sum(),
            Storage::Dict(dict) => dict
                .iter()
                .map(|(key, bitmap)| {
                    key.len() as u64 + STRING_ENTRY_OVERHEAD + bitmap.serialized_size() as u64
                })
                .sum(),
        }
    }

    fn int_values(&self, op: &str) -> Result<&[i32], CoreError> {
        match &self.storage {
            Storage::Ints(ivals) => Ok(ivals),
            _ => Err(CoreError::UnsupportedFieldType(format!(
                "{op} over field '{}' of type {}",
                self.name, self.field_type
            ))),
        }
    }
}
