use std::{fmt::Display, ops::Range};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{utils::vectors::Vec4, MutauError, MutauResult};

/// Parquet ingestion of NanoAOD-style flat tables.
pub mod io;

pub use io::{read_parquet, read_parquet_batches, write_parquet};

/// Placeholder stored in float columns when a physical value is undefined (no resolved pair,
/// negative mass squared, ...).
pub const EMPTY_FLOAT: f64 = -99999.0;

/// Placeholder stored in integer columns when a value is undefined.
pub const EMPTY_INT: i64 = -99999;

/// A list of values per event, stored as one contiguous buffer plus event offsets.
///
/// `offsets` always has one more entry than there are events, starts at zero and ends at
/// `values.len()`, so the values of event `i` are `values[offsets[i]..offsets[i + 1]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jagged<T> {
    offsets: Vec<usize>,
    values: Vec<T>,
}

impl<T> Jagged<T> {
    /// Build a jagged array from explicit offsets and values.
    pub fn from_offsets(offsets: Vec<usize>, values: Vec<T>) -> MutauResult<Self> {
        validate_offsets(&offsets, values.len(), "jagged array")?;
        Ok(Self { offsets, values })
    }

    /// Build a jagged array from one list per event.
    pub fn from_lists(lists: Vec<Vec<T>>) -> Self {
        let mut offsets = Vec::with_capacity(lists.len() + 1);
        offsets.push(0);
        let mut values = Vec::with_capacity(lists.iter().map(Vec::len).sum());
        for list in lists {
            values.extend(list);
            offsets.push(values.len());
        }
        Self { offsets, values }
    }

    /// A jagged array with `n_events` empty lists.
    pub fn empty(n_events: usize) -> Self {
        Self {
            offsets: vec![0; n_events + 1],
            values: Vec::new(),
        }
    }

    /// Number of events (rows).
    pub fn n_events(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Total number of values over all events.
    pub fn n_values(&self) -> usize {
        self.values.len()
    }

    /// The event offsets.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// The flat value buffer.
    pub fn values(&self) -> &[T] {
        &self.values
    }

    /// Range of flat indices which belong to `event`.
    pub fn range(&self, event: usize) -> Range<usize> {
        self.offsets[event]..self.offsets[event + 1]
    }

    /// Values of a single event.
    pub fn event(&self, event: usize) -> &[T] {
        &self.values[self.range(event)]
    }

    /// Number of values in a single event.
    pub fn count(&self, event: usize) -> usize {
        self.offsets[event + 1] - self.offsets[event]
    }

    /// Number of values in every event.
    pub fn counts(&self) -> Vec<usize> {
        self.offsets.windows(2).map(|w| w[1] - w[0]).collect()
    }

    /// Iterate over the per-event slices.
    pub fn iter(&self) -> impl Iterator<Item = &[T]> + '_ {
        self.offsets.windows(2).map(|w| &self.values[w[0]..w[1]])
    }

    /// Apply `op` to every value while keeping the event structure.
    pub fn map<U, F>(&self, op: F) -> Jagged<U>
    where
        F: FnMut(&T) -> U,
    {
        Jagged {
            offsets: self.offsets.clone(),
            values: self.values.iter().map(op).collect(),
        }
    }

    /// Whether both arrays have exactly the same event structure.
    pub fn same_layout<U>(&self, other: &Jagged<U>) -> bool {
        self.offsets == other.offsets
    }

    fn check_layout<U>(&self, other: &Jagged<U>, context: &str) -> MutauResult<()> {
        if self.same_layout(other) {
            Ok(())
        } else {
            Err(MutauError::LengthMismatch {
                context: context.to_string(),
                expected: self.n_values(),
                actual: other.n_values(),
            })
        }
    }
}

impl<T: Clone> Jagged<T> {
    /// First value of an event, if any.
    pub fn first(&self, event: usize) -> Option<T> {
        self.event(event).first().cloned()
    }

    /// Replace the list of every event where `keep` is false by an empty list.
    pub fn clear_where_not(&self, keep: &[bool]) -> MutauResult<Self> {
        if keep.len() != self.n_events() {
            return Err(MutauError::LengthMismatch {
                context: "jagged event mask".to_string(),
                expected: self.n_events(),
                actual: keep.len(),
            });
        }
        Ok(Jagged::from_lists(
            self.iter()
                .zip(keep)
                .map(|(list, &keep)| if keep { list.to_vec() } else { Vec::new() })
                .collect(),
        ))
    }

    /// Keep only the events where `keep` is true.
    pub fn filter_events(&self, keep: &[bool]) -> Self {
        Jagged::from_lists(
            self.iter()
                .zip(keep)
                .filter(|(_, &keep)| keep)
                .map(|(list, _)| list.to_vec())
                .collect(),
        )
    }
}

impl Jagged<bool> {
    /// A mask with the layout of `offsets` where every entry is `value`.
    pub fn filled(offsets: &[usize], value: bool) -> Self {
        let n = offsets.last().copied().unwrap_or(0);
        Self {
            offsets: offsets.to_vec(),
            values: vec![value; n],
        }
    }

    /// Per event: is at least one entry true?
    pub fn any(&self) -> Vec<bool> {
        self.iter().map(|list| list.iter().any(|&v| v)).collect()
    }

    /// Element-wise AND with another mask of the same layout.
    pub fn and(&self, other: &Jagged<bool>) -> MutauResult<Jagged<bool>> {
        self.check_layout(other, "mask AND")?;
        Ok(Jagged {
            offsets: self.offsets.clone(),
            values: self
                .values
                .iter()
                .zip(&other.values)
                .map(|(&a, &b)| a && b)
                .collect(),
        })
    }

    /// Element-wise negation.
    pub fn not(&self) -> Jagged<bool> {
        self.map(|v| !v)
    }

    /// Per event: the local indices of the true entries.
    pub fn local_indices(&self) -> Jagged<i64> {
        Jagged::from_lists(
            self.iter()
                .map(|list| {
                    list.iter()
                        .enumerate()
                        .filter(|(_, &v)| v)
                        .map(|(i, _)| i as i64)
                        .collect()
                })
                .collect(),
        )
    }
}

fn validate_offsets(offsets: &[usize], n_values: usize, context: &str) -> MutauResult<()> {
    if offsets.first() != Some(&0) {
        return Err(MutauError::Custom(format!(
            "Offsets of {context} must start at zero"
        )));
    }
    if offsets.windows(2).any(|w| w[1] < w[0]) {
        return Err(MutauError::Custom(format!(
            "Offsets of {context} must be non-decreasing"
        )));
    }
    let last = offsets.last().copied().unwrap_or(0);
    if last != n_values {
        return Err(MutauError::LengthMismatch {
            context: format!("offsets of {context}"),
            expected: last,
            actual: n_values,
        });
    }
    Ok(())
}

/// The type of a single column entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    /// Floating point.
    Float,
    /// Signed integer.
    Int,
    /// Boolean.
    Bool,
}

impl ValueKind {
    fn name(&self) -> &'static str {
        match self {
            ValueKind::Float => "float",
            ValueKind::Int => "int",
            ValueKind::Bool => "bool",
        }
    }
}

/// A single typed value, used to build collections and to express cut thresholds.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
}

impl Value {
    /// The kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Float(_) => ValueKind::Float,
            Value::Int(_) => ValueKind::Int,
            Value::Bool(_) => ValueKind::Bool,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Float(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

/// A flat, typed column. Attached to a [`Collection`] it holds one entry per object, attached
/// to an [`EventBatch`] it holds one entry per event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Column {
    /// Floating point values.
    Float(Vec<f64>),
    /// Integer values.
    Int(Vec<i64>),
    /// Boolean values.
    Bool(Vec<bool>),
}

impl Column {
    /// Number of entries.
    pub fn len(&self) -> usize {
        match self {
            Column::Float(v) => v.len(),
            Column::Int(v) => v.len(),
            Column::Bool(v) => v.len(),
        }
    }

    /// Whether the column has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The kind of values stored.
    pub fn kind(&self) -> ValueKind {
        match self {
            Column::Float(_) => ValueKind::Float,
            Column::Int(_) => ValueKind::Int,
            Column::Bool(_) => ValueKind::Bool,
        }
    }

    /// A column of `len` default values of the given kind.
    pub fn with_kind(kind: ValueKind, len: usize) -> Self {
        match kind {
            ValueKind::Float => Column::Float(vec![0.0; len]),
            ValueKind::Int => Column::Int(vec![0; len]),
            ValueKind::Bool => Column::Bool(vec![false; len]),
        }
    }

    fn type_error(&self, name: &str, expected: ValueKind) -> MutauError {
        MutauError::ColumnType {
            column: name.to_string(),
            expected: expected.name(),
            found: self.kind().name(),
        }
    }

    /// Borrow as floats; `name` is only used for the error message.
    pub fn as_floats(&self, name: &str) -> MutauResult<&[f64]> {
        match self {
            Column::Float(v) => Ok(v),
            other => Err(other.type_error(name, ValueKind::Float)),
        }
    }

    /// Borrow as integers; `name` is only used for the error message.
    pub fn as_ints(&self, name: &str) -> MutauResult<&[i64]> {
        match self {
            Column::Int(v) => Ok(v),
            other => Err(other.type_error(name, ValueKind::Int)),
        }
    }

    /// Borrow as booleans; `name` is only used for the error message.
    pub fn as_bools(&self, name: &str) -> MutauResult<&[bool]> {
        match self {
            Column::Bool(v) => Ok(v),
            other => Err(other.type_error(name, ValueKind::Bool)),
        }
    }

    fn push(&mut self, name: &str, value: Value) -> MutauResult<()> {
        match (self, value) {
            (Column::Float(v), Value::Float(x)) => v.push(x),
            (Column::Int(v), Value::Int(x)) => v.push(x),
            (Column::Bool(v), Value::Bool(x)) => v.push(x),
            (column, value) => {
                return Err(MutauError::ColumnType {
                    column: name.to_string(),
                    expected: column.kind().name(),
                    found: value.kind().name(),
                })
            }
        }
        Ok(())
    }

    fn filter(&self, keep: impl Fn(usize) -> bool) -> Column {
        fn pick<T: Copy>(v: &[T], keep: &impl Fn(usize) -> bool) -> Vec<T> {
            v.iter()
                .enumerate()
                .filter(|(i, _)| keep(*i))
                .map(|(_, x)| *x)
                .collect()
        }
        match self {
            Column::Float(v) => Column::Float(pick(v, &keep)),
            Column::Int(v) => Column::Int(pick(v, &keep)),
            Column::Bool(v) => Column::Bool(pick(v, &keep)),
        }
    }
}

/// A reference to a column, either an attribute of a physics-object collection (`Muon.pt`)
/// or an event-level column (`MET.pt`, `trigger_ids`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ColumnRef {
    /// An attribute of a jagged collection.
    Object {
        /// Collection name, e.g. `Muon`
        collection: String,
        /// Attribute name, e.g. `pt`
        field: String,
    },
    /// A per-event column (scalar or list).
    Event(String),
}

impl ColumnRef {
    /// Reference an object attribute.
    pub fn object(collection: &str, field: &str) -> Self {
        ColumnRef::Object {
            collection: collection.to_string(),
            field: field.to_string(),
        }
    }

    /// Reference several attributes of one collection.
    pub fn objects(collection: &str, fields: &[&str]) -> Vec<Self> {
        fields
            .iter()
            .map(|field| ColumnRef::object(collection, field))
            .collect()
    }

    /// Reference an event-level column.
    pub fn event(name: &str) -> Self {
        ColumnRef::Event(name.to_string())
    }
}

impl Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnRef::Object { collection, field } => write!(f, "{collection}.{field}"),
            ColumnRef::Event(name) => write!(f, "{name}"),
        }
    }
}

/// The pt/eta/phi/mass columns of a collection, borrowed together.
#[derive(Debug, Clone, Copy)]
pub struct Kinematics<'a> {
    offsets: &'a [usize],
    pt: &'a [f64],
    eta: &'a [f64],
    phi: &'a [f64],
    mass: &'a [f64],
}

impl Kinematics<'_> {
    /// Four-momentum of the object at local index `index` of `event`.
    pub fn p4(&self, event: usize, index: usize) -> Vec4 {
        let i = self.offsets[event] + index;
        Vec4::from_pt_eta_phi_m(self.pt[i], self.eta[i], self.phi[i], self.mass[i])
    }

    /// $`(\eta, \phi)`$ of the object at local index `index` of `event`.
    pub fn eta_phi(&self, event: usize, index: usize) -> (f64, f64) {
        let i = self.offsets[event] + index;
        (self.eta[i], self.phi[i])
    }

    /// Transverse momentum of the object at local index `index` of `event`.
    pub fn pt(&self, event: usize, index: usize) -> f64 {
        self.pt[self.offsets[event] + index]
    }
}

/// A jagged collection of physics objects (Muon, Tau, Jet, TrigObj, ...).
///
/// All attribute columns share the same event offsets, so an object is identified by its
/// event and its local index inside that event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    offsets: Vec<usize>,
    columns: IndexMap<String, Column>,
}

impl Collection {
    /// Create a collection with the given object counts and no attributes.
    pub fn from_counts(counts: &[usize]) -> Self {
        let mut offsets = Vec::with_capacity(counts.len() + 1);
        offsets.push(0);
        for count in counts {
            offsets.push(offsets[offsets.len() - 1] + count);
        }
        Self {
            offsets,
            columns: IndexMap::new(),
        }
    }

    /// Create a collection from offsets; attributes are added with [`Collection::set_column`].
    pub fn from_offsets(offsets: Vec<usize>) -> MutauResult<Self> {
        let n_objects = offsets.last().copied().unwrap_or(0);
        validate_offsets(&offsets, n_objects, "collection")?;
        Ok(Self {
            offsets,
            columns: IndexMap::new(),
        })
    }

    /// Number of events.
    pub fn n_events(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Total number of objects.
    pub fn n_objects(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    /// Event offsets shared by every attribute.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Flat index range of the objects of `event`.
    pub fn range(&self, event: usize) -> Range<usize> {
        self.offsets[event]..self.offsets[event + 1]
    }

    /// Number of objects in `event`.
    pub fn count(&self, event: usize) -> usize {
        self.offsets[event + 1] - self.offsets[event]
    }

    /// Attribute names in insertion order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Whether the attribute exists.
    pub fn contains(&self, field: &str) -> bool {
        self.columns.contains_key(field)
    }

    /// Borrow an attribute column.
    pub fn column(&self, field: &str) -> MutauResult<&Column> {
        self.columns
            .get(field)
            .ok_or_else(|| MutauError::MissingColumn {
                column: field.to_string(),
            })
    }

    /// Borrow a float attribute.
    pub fn floats(&self, field: &str) -> MutauResult<&[f64]> {
        self.column(field)?.as_floats(field)
    }

    /// Borrow an integer attribute.
    pub fn ints(&self, field: &str) -> MutauResult<&[i64]> {
        self.column(field)?.as_ints(field)
    }

    /// Borrow a boolean attribute.
    pub fn bools(&self, field: &str) -> MutauResult<&[bool]> {
        self.column(field)?.as_bools(field)
    }

    /// A boolean attribute as a jagged mask.
    pub fn mask(&self, field: &str) -> MutauResult<Jagged<bool>> {
        Ok(Jagged {
            offsets: self.offsets.clone(),
            values: self.bools(field)?.to_vec(),
        })
    }

    /// Borrow the pt/eta/phi/mass attributes.
    pub fn kinematics(&self) -> MutauResult<Kinematics<'_>> {
        Ok(Kinematics {
            offsets: &self.offsets,
            pt: self.floats("pt")?,
            eta: self.floats("eta")?,
            phi: self.floats("phi")?,
            mass: self.floats("mass")?,
        })
    }

    /// Add (or replace) an attribute column, which must have one entry per object.
    pub fn set_column(&mut self, field: &str, column: Column) -> MutauResult<()> {
        if column.len() != self.n_objects() {
            return Err(MutauError::LengthMismatch {
                context: format!("attribute \"{field}\""),
                expected: self.n_objects(),
                actual: column.len(),
            });
        }
        self.columns.insert(field.to_string(), column);
        Ok(())
    }

    /// Add (or replace) a boolean attribute from a jagged mask with this collection's layout.
    pub fn set_mask(&mut self, field: &str, mask: Jagged<bool>) -> MutauResult<()> {
        if mask.offsets != self.offsets {
            return Err(MutauError::LengthMismatch {
                context: format!("mask \"{field}\""),
                expected: self.n_objects(),
                actual: mask.n_values(),
            });
        }
        self.set_column(field, Column::Bool(mask.values))
    }

    /// Remove an attribute, returning it if present.
    pub fn remove_column(&mut self, field: &str) -> Option<Column> {
        self.columns.shift_remove(field)
    }

    /// Keep only the events where `keep` is true (objects of dropped events are dropped too).
    pub fn filter_events(&self, keep: &[bool]) -> Collection {
        let counts: Vec<usize> = (0..self.n_events())
            .filter(|&event| keep[event])
            .map(|event| self.count(event))
            .collect();
        let mut object_keep = vec![false; self.n_objects()];
        for (event, &k) in keep.iter().enumerate() {
            if k {
                for i in self.range(event) {
                    object_keep[i] = true;
                }
            }
        }
        let mut filtered = Collection::from_counts(&counts);
        for (name, column) in &self.columns {
            filtered
                .columns
                .insert(name.clone(), column.filter(|i| object_keep[i]));
        }
        filtered
    }
}

/// Incrementally build a [`Collection`] event by event.
///
/// The first object pushed defines the attribute schema unless it was declared up front with
/// [`CollectionBuilder::declare`]; every later object must provide exactly the same
/// attributes with the same types.
#[derive(Debug, Clone)]
pub struct CollectionBuilder {
    offsets: Vec<usize>,
    columns: IndexMap<String, Column>,
}

impl Default for CollectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectionBuilder {
    /// Start an empty collection.
    pub fn new() -> Self {
        Self {
            offsets: vec![0],
            columns: IndexMap::new(),
        }
    }

    /// Declare an attribute before any object is pushed.
    pub fn declare(mut self, field: &str, kind: ValueKind) -> Self {
        self.columns
            .entry(field.to_string())
            .or_insert_with(|| Column::with_kind(kind, 0));
        self
    }

    /// Append one event with the given objects.
    pub fn push_event(&mut self, objects: &[&[(&str, Value)]]) -> MutauResult<&mut Self> {
        for object in objects {
            if self.columns.is_empty() {
                for (field, value) in object.iter() {
                    self.columns
                        .insert(field.to_string(), Column::with_kind(value.kind(), 0));
                }
            }
            if object.len() != self.columns.len() {
                let missing = self
                    .columns
                    .keys()
                    .find(|name| !object.iter().any(|(field, _)| field == name))
                    .cloned()
                    .unwrap_or_else(|| "<extra attribute>".to_string());
                return Err(MutauError::MissingColumn { column: missing });
            }
            for (field, value) in object.iter() {
                let column =
                    self.columns
                        .get_mut(*field)
                        .ok_or_else(|| MutauError::MissingColumn {
                            column: field.to_string(),
                        })?;
                column.push(field, *value)?;
            }
        }
        let last = self.offsets[self.offsets.len() - 1];
        self.offsets.push(last + objects.len());
        Ok(self)
    }

    /// Finish the collection.
    pub fn build(self) -> Collection {
        Collection {
            offsets: self.offsets,
            columns: self.columns,
        }
    }
}

/// A batch (chunk) of events: per-event columns, per-event integer lists and jagged
/// physics-object collections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    n_events: usize,
    fields: IndexMap<String, Column>,
    lists: IndexMap<String, Jagged<i64>>,
    collections: IndexMap<String, Collection>,
}

impl EventBatch {
    /// An empty batch of `n_events` events.
    pub fn new(n_events: usize) -> Self {
        Self {
            n_events,
            fields: IndexMap::new(),
            lists: IndexMap::new(),
            collections: IndexMap::new(),
        }
    }

    /// Number of events.
    pub fn n_events(&self) -> usize {
        self.n_events
    }

    /// Names of the per-event scalar columns.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Names of the per-event list columns.
    pub fn list_names(&self) -> impl Iterator<Item = &str> {
        self.lists.keys().map(String::as_str)
    }

    /// Names of the object collections.
    pub fn collection_names(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    /// Whether the referenced column exists in this batch.
    pub fn contains(&self, column: &ColumnRef) -> bool {
        match column {
            ColumnRef::Object { collection, field } => self
                .collections
                .get(collection)
                .is_some_and(|c| c.contains(field)),
            ColumnRef::Event(name) => {
                self.fields.contains_key(name) || self.lists.contains_key(name)
            }
        }
    }

    /// Add (or replace) a per-event column.
    pub fn set_field(&mut self, name: &str, column: Column) -> MutauResult<()> {
        if column.len() != self.n_events {
            return Err(MutauError::LengthMismatch {
                context: format!("event column \"{name}\""),
                expected: self.n_events,
                actual: column.len(),
            });
        }
        self.fields.insert(name.to_string(), column);
        Ok(())
    }

    /// Borrow a per-event column.
    pub fn field(&self, name: &str) -> MutauResult<&Column> {
        self.fields
            .get(name)
            .ok_or_else(|| MutauError::MissingColumn {
                column: name.to_string(),
            })
    }

    /// Borrow a per-event float column.
    pub fn floats(&self, name: &str) -> MutauResult<&[f64]> {
        self.field(name)?.as_floats(name)
    }

    /// Borrow a per-event integer column.
    pub fn ints(&self, name: &str) -> MutauResult<&[i64]> {
        self.field(name)?.as_ints(name)
    }

    /// Borrow a per-event boolean column.
    pub fn bools(&self, name: &str) -> MutauResult<&[bool]> {
        self.field(name)?.as_bools(name)
    }

    /// Remove a per-event column.
    pub fn remove_field(&mut self, name: &str) -> Option<Column> {
        self.fields.shift_remove(name)
    }

    /// Add (or replace) a per-event integer list column.
    pub fn set_list(&mut self, name: &str, list: Jagged<i64>) -> MutauResult<()> {
        if list.n_events() != self.n_events {
            return Err(MutauError::LengthMismatch {
                context: format!("list column \"{name}\""),
                expected: self.n_events,
                actual: list.n_events(),
            });
        }
        self.lists.insert(name.to_string(), list);
        Ok(())
    }

    /// Borrow a per-event integer list column.
    pub fn list(&self, name: &str) -> MutauResult<&Jagged<i64>> {
        self.lists
            .get(name)
            .ok_or_else(|| MutauError::MissingColumn {
                column: name.to_string(),
            })
    }

    /// Add (or replace) a collection.
    pub fn set_collection(&mut self, name: &str, collection: Collection) -> MutauResult<()> {
        if collection.n_events() != self.n_events {
            return Err(MutauError::LengthMismatch {
                context: format!("collection \"{name}\""),
                expected: self.n_events,
                actual: collection.n_events(),
            });
        }
        self.collections.insert(name.to_string(), collection);
        Ok(())
    }

    /// Borrow a collection.
    pub fn collection(&self, name: &str) -> MutauResult<&Collection> {
        self.collections
            .get(name)
            .ok_or_else(|| MutauError::MissingColumn {
                column: name.to_string(),
            })
    }

    /// Mutably borrow a collection.
    pub fn collection_mut(&mut self, name: &str) -> MutauResult<&mut Collection> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| MutauError::MissingColumn {
                column: name.to_string(),
            })
    }

    /// Keep only the events where `keep` is true.
    pub fn filter_events(&self, keep: &[bool]) -> MutauResult<EventBatch> {
        if keep.len() != self.n_events {
            return Err(MutauError::LengthMismatch {
                context: "event mask".to_string(),
                expected: self.n_events,
                actual: keep.len(),
            });
        }
        Ok(EventBatch {
            n_events: keep.iter().filter(|&&k| k).count(),
            fields: self
                .fields
                .iter()
                .map(|(name, column)| (name.clone(), column.filter(|i| keep[i])))
                .collect(),
            lists: self
                .lists
                .iter()
                .map(|(name, list)| (name.clone(), list.filter_events(keep)))
                .collect(),
            collections: self
                .collections
                .iter()
                .map(|(name, collection)| (name.clone(), collection.filter_events(keep)))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn muons() -> Collection {
        let mut builder = CollectionBuilder::new()
            .declare("pt", ValueKind::Float)
            .declare("charge", ValueKind::Int);
        builder
            .push_event(&[
                &[("pt", 30.0.into()), ("charge", 1.into())],
                &[("pt", 12.0.into()), ("charge", (-1).into())],
            ])
            .unwrap();
        builder.push_event(&[]).unwrap();
        builder
            .push_event(&[&[("pt", 45.0.into()), ("charge", (-1).into())]])
            .unwrap();
        builder.build()
    }

    #[test]
    fn test_jagged_layout() {
        let j = Jagged::from_lists(vec![vec![1, 2], vec![], vec![3]]);
        assert_eq!(j.n_events(), 3);
        assert_eq!(j.offsets(), &[0, 2, 2, 3]);
        assert_eq!(j.event(0), &[1, 2]);
        assert_eq!(j.event(1), &[] as &[i32]);
        assert_eq!(j.counts(), vec![2, 0, 1]);
        assert_eq!(j.first(2), Some(3));
        assert_eq!(j.first(1), None);
    }

    #[test]
    fn test_jagged_rejects_bad_offsets() {
        assert!(Jagged::from_offsets(vec![0, 2, 1], vec![1, 2]).is_err());
        assert!(Jagged::from_offsets(vec![1, 2], vec![1]).is_err());
        assert!(Jagged::from_offsets(vec![0, 3], vec![1, 2]).is_err());
        assert!(Jagged::from_offsets(vec![0, 1, 2], vec![1, 2]).is_ok());
    }

    #[test]
    fn test_mask_operations() {
        let a = Jagged::from_lists(vec![vec![true, false], vec![], vec![true]]);
        let b = Jagged::from_lists(vec![vec![false, false], vec![], vec![true]]);
        assert_eq!(a.any(), vec![true, false, true]);
        assert_eq!(a.and(&b).unwrap().any(), vec![false, false, true]);
        assert_eq!(a.not().any(), vec![true, false, false]);
        assert_eq!(
            a.local_indices(),
            Jagged::from_lists(vec![vec![0], vec![], vec![0]])
        );
        let c = Jagged::from_lists(vec![vec![true], vec![true], vec![true]]);
        assert!(a.and(&c).is_err());
    }

    #[test]
    fn test_clear_where_not() {
        let j = Jagged::from_lists(vec![vec![3i64], vec![1], vec![]]);
        let cleared = j.clear_where_not(&[true, false, true]).unwrap();
        assert_eq!(cleared, Jagged::from_lists(vec![vec![3], vec![], vec![]]));
        assert!(j.clear_where_not(&[true]).is_err());
    }

    #[test]
    fn test_collection_builder() {
        let muons = muons();
        assert_eq!(muons.n_events(), 3);
        assert_eq!(muons.n_objects(), 3);
        assert_eq!(muons.count(1), 0);
        assert_eq!(muons.floats("pt").unwrap(), &[30.0, 12.0, 45.0]);
        assert_eq!(muons.ints("charge").unwrap(), &[1, -1, -1]);
        assert!(matches!(
            muons.floats("charge"),
            Err(MutauError::ColumnType { .. })
        ));
        assert!(matches!(
            muons.floats("eta"),
            Err(MutauError::MissingColumn { .. })
        ));
    }

    #[test]
    fn test_collection_builder_rejects_inconsistent_objects() {
        let mut builder = CollectionBuilder::new();
        builder.push_event(&[&[("pt", 30.0.into())]]).unwrap();
        assert!(builder.push_event(&[&[("pt", 1.into())]]).is_err());
        assert!(builder
            .push_event(&[&[("pt", 1.0.into()), ("eta", 0.1.into())]])
            .is_err());
        assert!(builder.push_event(&[&[("eta", 1.0.into())]]).is_err());
    }

    #[test]
    fn test_collection_set_column_checks_length() {
        let mut muons = muons();
        assert!(muons
            .set_column("iso", Column::Float(vec![0.1, 0.2]))
            .is_err());
        muons
            .set_column("iso", Column::Float(vec![0.1, 0.2, 0.3]))
            .unwrap();
        let mask = Jagged::from_lists(vec![vec![true, false], vec![], vec![true]]);
        muons.set_mask("good", mask.clone()).unwrap();
        assert_eq!(muons.mask("good").unwrap(), mask);
    }

    #[test]
    fn test_batch_columns_and_filter() {
        let mut batch = EventBatch::new(3);
        batch
            .set_field("event", Column::Int(vec![10, 11, 12]))
            .unwrap();
        assert!(batch.set_field("bad", Column::Int(vec![1])).is_err());
        batch.set_collection("Muon", muons()).unwrap();
        batch
            .set_list("ids", Jagged::from_lists(vec![vec![1], vec![], vec![2, 3]]))
            .unwrap();
        assert!(batch.contains(&ColumnRef::object("Muon", "pt")));
        assert!(batch.contains(&ColumnRef::event("ids")));
        assert!(!batch.contains(&ColumnRef::object("Tau", "pt")));

        let filtered = batch.filter_events(&[true, false, true]).unwrap();
        assert_eq!(filtered.n_events(), 2);
        assert_eq!(filtered.ints("event").unwrap(), &[10, 12]);
        let muons = filtered.collection("Muon").unwrap();
        assert_eq!(muons.floats("pt").unwrap(), &[30.0, 12.0, 45.0]);
        assert_eq!(muons.offsets(), &[0, 2, 3]);
        assert_eq!(filtered.list("ids").unwrap().event(1), &[2, 3]);

        let dropped = batch.filter_events(&[false, true, false]).unwrap();
        assert_eq!(dropped.collection("Muon").unwrap().n_objects(), 0);
    }

    #[test]
    fn test_column_ref_display() {
        assert_eq!(ColumnRef::object("Muon", "pt").to_string(), "Muon.pt");
        assert_eq!(ColumnRef::event("MET.pt").to_string(), "MET.pt");
    }
}
