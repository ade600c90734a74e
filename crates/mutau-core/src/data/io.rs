//! Reading and writing [`EventBatch`]es as flat NanoAOD-style Parquet tables.
//!
//! Object attributes are stored as list columns named `<Collection>_<field>` (the collection
//! name starts with an uppercase letter, e.g. `Muon_pt`), optionally accompanied by a
//! `n<Collection>` counter which is ignored on read. Scalar columns whose prefix is one of the
//! grouped NanoAOD branches (`MET_pt`, `HLT_IsoMu24`, ...) become dotted event fields
//! (`MET.pt`, `HLT.IsoMu24`); every other scalar keeps its name. Lowercase integer list
//! columns (`trigger_ids`, `category_ids`, ...) become per-event lists.

use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};

use arrow::{
    array::{
        Array, ArrayRef, AsArray, BooleanArray, Float64Array, Int32Array, Int64Array, ListArray,
    },
    buffer::{OffsetBuffer, ScalarBuffer},
    compute::{cast_with_options, concat_batches, CastOptions},
    datatypes::{DataType, Field, Float64Type, Int64Type, Schema},
    record_batch::RecordBatch,
};
use indexmap::{map::Entry, IndexMap};
use parquet::arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter};
use tracing::debug;

use super::{Collection, Column, EventBatch, Jagged};
use crate::{MutauError, MutauResult};

/// Scalar branch prefixes which are grouped into dotted event fields.
pub const EVENT_GROUPS: [&str; 7] = ["MET", "PuppiMET", "HLT", "Flag", "Pileup", "L1", "PV"];

fn canonicalize_path(file_path: &str) -> MutauResult<PathBuf> {
    Ok(Path::new(&*shellexpand::full(file_path)?).canonicalize()?)
}

fn expand_output_path(file_path: &str) -> MutauResult<PathBuf> {
    Ok(PathBuf::from(&*shellexpand::full(file_path)?))
}

/// Load a whole Parquet file as a single [`EventBatch`].
pub fn read_parquet(file_path: &str) -> MutauResult<EventBatch> {
    let path = canonicalize_path(file_path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
    let schema = builder.schema().clone();
    let total_rows = builder.metadata().file_metadata().num_rows() as usize;
    let reader = builder.with_batch_size(total_rows.max(1)).build()?;
    let record_batches = reader.collect::<Result<Vec<_>, _>>()?;
    let record_batch = concat_batches(&schema, &record_batches)?;
    debug!(file = file_path, events = total_rows, "read Parquet file");
    record_batch_to_event_batch(&record_batch)
}

/// Load a Parquet file as a sequence of [`EventBatch`]es of at most `batch_size` events.
pub fn read_parquet_batches(file_path: &str, batch_size: usize) -> MutauResult<Vec<EventBatch>> {
    let path = canonicalize_path(file_path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
    let reader = builder.with_batch_size(batch_size.max(1)).build()?;
    let batches = reader
        .map(|record_batch| record_batch_to_event_batch(&record_batch?))
        .collect::<MutauResult<Vec<_>>>()?;
    debug!(
        file = file_path,
        batches = batches.len(),
        "read Parquet file in batches"
    );
    Ok(batches)
}

/// Persist an [`EventBatch`] (including every produced column) to a Parquet file.
pub fn write_parquet(batch: &EventBatch, file_path: &str) -> MutauResult<()> {
    let path = expand_output_path(file_path)?;
    let record_batch = event_batch_to_record_batch(batch)?;
    let mut writer = ArrowWriter::try_new(File::create(&path)?, record_batch.schema(), None)?;
    writer.write(&record_batch)?;
    writer.close()?;
    Ok(())
}

fn field_name_from_scalar(name: &str) -> String {
    match name.split_once('_') {
        Some((prefix, rest)) if EVENT_GROUPS.contains(&prefix) => format!("{prefix}.{rest}"),
        _ => name.to_string(),
    }
}

fn object_column_name(name: &str) -> Option<(&str, &str)> {
    let (collection, field) = name.split_once('_')?;
    collection
        .chars()
        .next()
        .is_some_and(char::is_uppercase)
        .then_some((collection, field))
}

fn is_counter(name: &str, collections: &IndexMap<String, Collection>) -> bool {
    name.strip_prefix('n')
        .is_some_and(|collection| collections.contains_key(collection))
}

fn reject_nulls(name: &str, array: &dyn Array) -> MutauResult<()> {
    match array.null_count() {
        0 => Ok(()),
        count => Err(MutauError::NullValues {
            column: name.to_string(),
            count,
        }),
    }
}

/// Casts without turning out-of-range values into nulls.
fn strict_cast(array: &ArrayRef, to: &DataType) -> MutauResult<ArrayRef> {
    let options = CastOptions {
        safe: false,
        ..Default::default()
    };
    Ok(cast_with_options(array.as_ref(), to, &options)?)
}

fn flat_column(name: &str, array: &ArrayRef) -> MutauResult<Column> {
    reject_nulls(name, array.as_ref())?;
    let dtype = array.data_type();
    if dtype == &DataType::Boolean {
        let values = array.as_boolean();
        Ok(Column::Bool((0..values.len()).map(|i| values.value(i)).collect()))
    } else if dtype.is_floating() {
        let values = strict_cast(array, &DataType::Float64)?;
        Ok(Column::Float(
            values.as_primitive::<Float64Type>().values().to_vec(),
        ))
    } else if dtype.is_integer() {
        let values = strict_cast(array, &DataType::Int64)?;
        Ok(Column::Int(values.as_primitive::<Int64Type>().values().to_vec()))
    } else {
        Err(MutauError::ColumnType {
            column: name.to_string(),
            expected: "float, int or bool",
            found: "unsupported Arrow type",
        })
    }
}

fn list_column(name: &str, array: &ArrayRef) -> MutauResult<(Vec<usize>, Column)> {
    reject_nulls(name, array.as_ref())?;
    let (raw_offsets, values): (Vec<usize>, &ArrayRef) = match array.data_type() {
        DataType::List(_) => {
            let list = array.as_list::<i32>();
            (
                list.value_offsets().iter().map(|&o| o as usize).collect(),
                list.values(),
            )
        }
        DataType::LargeList(_) => {
            let list = array.as_list::<i64>();
            (
                list.value_offsets().iter().map(|&o| o as usize).collect(),
                list.values(),
            )
        }
        _ => {
            return Err(MutauError::ColumnType {
                column: name.to_string(),
                expected: "list",
                found: "scalar",
            })
        }
    };
    let first = raw_offsets.first().copied().unwrap_or(0);
    let last = raw_offsets.last().copied().unwrap_or(0);
    let offsets = raw_offsets.iter().map(|o| o - first).collect();
    let values = values.slice(first, last - first);
    Ok((offsets, flat_column(name, &values)?))
}

fn record_batch_to_event_batch(record_batch: &RecordBatch) -> MutauResult<EventBatch> {
    let schema = record_batch.schema();
    let mut batch = EventBatch::new(record_batch.num_rows());
    let mut collections: IndexMap<String, Collection> = IndexMap::new();
    let mut scalars = Vec::new();
    for (field, array) in schema.fields().iter().zip(record_batch.columns()) {
        let name = field.name();
        let is_list = matches!(
            field.data_type(),
            DataType::List(_) | DataType::LargeList(_)
        );
        if !is_list {
            scalars.push((name, array));
            continue;
        }
        let (offsets, column) = list_column(name, array)?;
        match object_column_name(name) {
            Some((collection_name, field_name)) => {
                let collection = match collections.entry(collection_name.to_string()) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => entry.insert(Collection::from_offsets(offsets.clone())?),
                };
                if collection.offsets() != offsets.as_slice() {
                    return Err(MutauError::LengthMismatch {
                        context: format!("list column \"{name}\""),
                        expected: collection.n_objects(),
                        actual: column.len(),
                    });
                }
                collection.set_column(field_name, column)?;
            }
            None => {
                let values = match column {
                    Column::Int(values) => values,
                    other => {
                        return Err(MutauError::ColumnType {
                            column: name.to_string(),
                            expected: "int",
                            found: match other {
                                Column::Float(_) => "float",
                                _ => "bool",
                            },
                        })
                    }
                };
                batch.set_list(name, Jagged::from_offsets(offsets, values)?)?;
            }
        }
    }
    for (name, array) in scalars {
        if is_counter(name, &collections) {
            continue;
        }
        batch.set_field(&field_name_from_scalar(name), flat_column(name, array)?)?;
    }
    for (name, collection) in collections {
        batch.set_collection(&name, collection)?;
    }
    Ok(batch)
}

fn flat_array(column: &Column) -> ArrayRef {
    match column {
        Column::Float(values) => Arc::new(Float64Array::from(values.clone())),
        Column::Int(values) => Arc::new(Int64Array::from(values.clone())),
        Column::Bool(values) => Arc::new(BooleanArray::from(values.clone())),
    }
}

fn list_array(offsets: &[usize], values: ArrayRef) -> MutauResult<ArrayRef> {
    let offsets = offsets
        .iter()
        .map(|&o| i32::try_from(o))
        .collect::<Result<Vec<i32>, _>>()
        .map_err(|_| MutauError::Custom("List column too large for 32-bit offsets".to_string()))?;
    let item = Arc::new(Field::new("item", values.data_type().clone(), true));
    Ok(Arc::new(ListArray::try_new(
        item,
        OffsetBuffer::new(ScalarBuffer::from(offsets)),
        values,
        None,
    )?))
}

fn event_batch_to_record_batch(batch: &EventBatch) -> MutauResult<RecordBatch> {
    let mut fields = Vec::new();
    let mut arrays: Vec<ArrayRef> = Vec::new();
    for name in batch.field_names() {
        let array = flat_array(batch.field(name)?);
        fields.push(Field::new(name.replace('.', "_"), array.data_type().clone(), false));
        arrays.push(array);
    }
    for name in batch.list_names() {
        let list = batch.list(name)?;
        let array = list_array(
            list.offsets(),
            Arc::new(Int64Array::from(list.values().to_vec())),
        )?;
        fields.push(Field::new(name, array.data_type().clone(), false));
        arrays.push(array);
    }
    for collection_name in batch.collection_names() {
        let collection = batch.collection(collection_name)?;
        let counts = (0..collection.n_events())
            .map(|event| collection.count(event) as i32)
            .collect::<Vec<_>>();
        fields.push(Field::new(
            format!("n{collection_name}"),
            DataType::Int32,
            false,
        ));
        arrays.push(Arc::new(Int32Array::from(counts)));
        for field_name in collection.field_names() {
            let array = list_array(
                collection.offsets(),
                flat_array(collection.column(field_name)?),
            )?;
            fields.push(Field::new(
                format!("{collection_name}_{field_name}"),
                array.data_type().clone(),
                false,
            ));
            arrays.push(array);
        }
    }
    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

#[cfg(test)]
mod tests {
    use arrow::{
        array::{Float32Array, StringArray, UInt64Array, UInt8Array},
        datatypes::{Float32Type, Int32Type},
    };

    use super::*;
    use crate::data::{CollectionBuilder, Value};

    fn temp_path(stem: &str) -> String {
        std::env::temp_dir()
            .join(format!("{stem}_{}.parquet", fastrand::u64(..)))
            .to_string_lossy()
            .into_owned()
    }

    fn write_record_batch(record_batch: &RecordBatch, path: &str) {
        let mut writer =
            ArrowWriter::try_new(File::create(path).unwrap(), record_batch.schema(), None)
                .unwrap();
        writer.write(record_batch).unwrap();
        writer.close().unwrap();
    }

    fn nanoaod_record_batch() -> RecordBatch {
        let pt: ArrayRef = Arc::new(ListArray::from_iter_primitive::<Float32Type, _, _>(vec![
            Some(vec![Some(30.0), Some(12.5)]),
            Some(vec![]),
            Some(vec![Some(45.0)]),
        ]));
        let charge: ArrayRef = Arc::new(ListArray::from_iter_primitive::<Int32Type, _, _>(vec![
            Some(vec![Some(1), Some(-1)]),
            Some(vec![]),
            Some(vec![Some(-1)]),
        ]));
        let medium = list_array(
            &[0, 2, 2, 3],
            Arc::new(BooleanArray::from(vec![true, false, true])),
        )
        .unwrap();
        let columns: Vec<(&str, ArrayRef)> = vec![
            ("event", Arc::new(UInt64Array::from(vec![7u64, 8, 9]))),
            ("nMuon", Arc::new(UInt8Array::from(vec![2u8, 0, 1]))),
            ("Muon_pt", pt),
            ("Muon_charge", charge),
            ("Muon_mediumId", medium),
            (
                "MET_pt",
                Arc::new(Float32Array::from(vec![10.0f32, 20.0, 30.0])),
            ),
            (
                "HLT_IsoMu24",
                Arc::new(BooleanArray::from(vec![true, false, true])),
            ),
            (
                "genWeight",
                Arc::new(Float32Array::from(vec![1.0f32, -1.0, 0.5])),
            ),
        ];
        RecordBatch::try_from_iter(columns).unwrap()
    }

    #[test]
    fn test_read_nanoaod_layout() {
        let path = temp_path("mutau_nanoaod");
        write_record_batch(&nanoaod_record_batch(), &path);
        let batch = read_parquet(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(batch.n_events(), 3);
        assert_eq!(batch.ints("event").unwrap(), &[7, 8, 9]);
        assert_eq!(batch.floats("MET.pt").unwrap(), &[10.0, 20.0, 30.0]);
        assert_eq!(batch.bools("HLT.IsoMu24").unwrap(), &[true, false, true]);
        assert_eq!(batch.floats("genWeight").unwrap(), &[1.0, -1.0, 0.5]);
        assert!(batch.field("nMuon").is_err());
        let muons = batch.collection("Muon").unwrap();
        assert_eq!(muons.offsets(), &[0, 2, 2, 3]);
        assert_eq!(muons.floats("pt").unwrap(), &[30.0, 12.5, 45.0]);
        assert_eq!(muons.ints("charge").unwrap(), &[1, -1, -1]);
        assert_eq!(muons.bools("mediumId").unwrap(), &[true, false, true]);
    }

    #[test]
    fn test_read_in_batches() {
        let path = temp_path("mutau_batches");
        write_record_batch(&nanoaod_record_batch(), &path);
        let batches = read_parquet_batches(&path, 2).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].n_events(), 2);
        assert_eq!(batches[1].n_events(), 1);
        let muons = batches[1].collection("Muon").unwrap();
        assert_eq!(muons.offsets(), &[0, 1]);
        assert_eq!(muons.floats("pt").unwrap(), &[45.0]);
    }

    #[test]
    fn test_write_then_read_selection_output() {
        let mut builder = CollectionBuilder::new();
        builder
            .push_event(&[&[("pt", Value::Float(27.0)), ("preselected", true.into())]])
            .unwrap();
        builder.push_event(&[]).unwrap();
        let mut batch = EventBatch::new(2);
        batch.set_collection("Muon", builder.build()).unwrap();
        batch
            .set_field("mutau_mass", Column::Float(vec![91.2, -99999.0]))
            .unwrap();
        batch
            .set_list(
                "category_ids",
                Jagged::from_lists(vec![vec![1, 107], vec![1]]),
            )
            .unwrap();

        let path = temp_path("mutau_output");
        write_parquet(&batch, &path).unwrap();
        let read = read_parquet(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(read, batch);
    }

    #[test]
    fn test_mismatched_collection_layout_is_rejected() {
        let pt: ArrayRef = Arc::new(ListArray::from_iter_primitive::<Float32Type, _, _>(vec![
            Some(vec![Some(30.0)]),
            Some(vec![]),
        ]));
        let eta: ArrayRef = Arc::new(ListArray::from_iter_primitive::<Float32Type, _, _>(vec![
            Some(vec![]),
            Some(vec![Some(0.5)]),
        ]));
        let record_batch =
            RecordBatch::try_from_iter(vec![("Tau_pt", pt), ("Tau_eta", eta)]).unwrap();
        assert!(matches!(
            record_batch_to_event_batch(&record_batch),
            Err(MutauError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_null_event_field_is_rejected() {
        let met: ArrayRef = Arc::new(Float32Array::from(vec![Some(12.5f32), None, Some(40.0)]));
        let record_batch = RecordBatch::try_from_iter(vec![("MET_pt", met)]).unwrap();
        let path = temp_path("mutau_null_met");
        write_record_batch(&record_batch, &path);
        let result = read_parquet(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(
            result,
            Err(MutauError::NullValues { count: 1, .. })
        ));
    }

    #[test]
    fn test_null_object_attribute_is_rejected() {
        let pt: ArrayRef = Arc::new(ListArray::from_iter_primitive::<Float32Type, _, _>(vec![
            Some(vec![Some(30.0), None]),
            Some(vec![Some(22.0)]),
        ]));
        let record_batch = RecordBatch::try_from_iter(vec![("Muon_pt", pt)]).unwrap();
        assert!(matches!(
            record_batch_to_event_batch(&record_batch),
            Err(MutauError::NullValues { count: 1, .. })
        ));

        let pt: ArrayRef = Arc::new(ListArray::from_iter_primitive::<Float32Type, _, _>(vec![
            Some(vec![Some(30.0)]),
            None,
        ]));
        let record_batch = RecordBatch::try_from_iter(vec![("Muon_pt", pt)]).unwrap();
        assert!(matches!(
            record_batch_to_event_batch(&record_batch),
            Err(MutauError::NullValues { count: 1, .. })
        ));
    }

    #[test]
    fn test_null_bool_is_not_read_as_false() {
        let hlt: ArrayRef = Arc::new(BooleanArray::from(vec![Some(true), None]));
        assert!(matches!(
            flat_column("HLT_IsoMu24", &hlt),
            Err(MutauError::NullValues { .. })
        ));
    }

    #[test]
    fn test_out_of_range_integer_is_rejected() {
        let event: ArrayRef = Arc::new(UInt64Array::from(vec![7u64, u64::MAX]));
        assert!(matches!(
            flat_column("event", &event),
            Err(MutauError::ArrowError(_))
        ));
    }

    #[test]
    fn test_non_numeric_column_is_rejected() {
        let dataset: ArrayRef = Arc::new(StringArray::from(vec!["dy_incl", "dy_incl"]));
        let met: ArrayRef = Arc::new(Float32Array::from(vec![10.0f32, 20.0]));
        let record_batch =
            RecordBatch::try_from_iter(vec![("dataset", dataset), ("MET_pt", met)]).unwrap();
        let path = temp_path("mutau_utf8");
        write_record_batch(&record_batch, &path);
        let result = read_parquet(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(
            result,
            Err(MutauError::ColumnType { ref column, .. }) if column == "dataset"
        ));
    }
}
