//! Store serialization
//!
//! A store with one partition is written as the engine's native blob,
//! unchanged, so blobs of unpartitioned indexes stay readable by anything
//! that reads native blobs. Partitioned stores use the multi-view layout:
//!
//! ```text
//! magic        b"MVHN"
//! version      u32 = 0
//! partitions   u32
//! label arrays u32 (equals partitions)
//! labels       per partition: len u64, u32 * len
//! rows_sum     len u64, u32 * len (partitions + 1 entries)
//! l2o          len u64, u32 * len (one entry per label)
//! sub-indexes  per partition: native blob
//! ```
//!
//! Native blobs start with the engine's own fourcc, which never equals the
//! multi-view magic, so the first four bytes decide the layout. All integers
//! are little-endian.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use stratavec_core::{IndexError, Result};
use stratavec_engine::{read_sub_index, write_sub_index, SubIndex};
use tracing::{debug, error};

use crate::store::{PartitionedIndexStore, StoreLayout};

/// Leading magic of the multi-view layout
pub const MV_MAGIC: [u8; 4] = *b"MVHN";
/// Only multi-view version understood by this reader
pub const MV_VERSION: u32 = 0;

fn blob_error(msg: impl Into<String>) -> IndexError {
    IndexError::InvalidSerializedBlob(msg.into())
}

/// Encode `store`
pub fn write_store(store: &PartitionedIndexStore) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    if !store.is_partitioned() {
        write_sub_index(store.handle(0)?, &mut buf);
        return Ok(buf);
    }

    let layout = store.layout();
    buf.extend_from_slice(&MV_MAGIC);
    buf.write_u32::<LittleEndian>(MV_VERSION)?;
    buf.write_u32::<LittleEndian>(store.partition_count() as u32)?;
    buf.write_u32::<LittleEndian>(layout.labels.len() as u32)?;
    for labels in &layout.labels {
        write_u32s(&mut buf, labels)?;
    }
    write_u32s(&mut buf, &layout.index_rows_sum)?;
    write_u32s(&mut buf, &layout.label_to_internal_offset)?;
    for p in 0..store.partition_count() {
        write_sub_index(store.handle(p)?, &mut buf);
    }
    debug!(
        target: "stratavec::index",
        partitions = store.partition_count(),
        bytes = buf.len(),
        "Encoded partitioned store"
    );
    Ok(buf)
}

fn write_u32s(buf: &mut Vec<u8>, values: &[u32]) -> Result<()> {
    buf.write_u64::<LittleEndian>(values.len() as u64)?;
    for &v in values {
        buf.write_u32::<LittleEndian>(v)?;
    }
    Ok(())
}

/// Decode a store written by [`write_store`]
///
/// Every partition of the returned store is final.
pub fn read_store(bytes: &[u8]) -> Result<PartitionedIndexStore> {
    let mut input = bytes;
    let mut store = if bytes.starts_with(&MV_MAGIC) {
        input = &input[MV_MAGIC.len()..];
        read_partitioned(&mut input)?
    } else {
        PartitionedIndexStore::single(read_native(&mut input)?)
    };
    if !input.is_empty() {
        return Err(blob_error(format!(
            "{} trailing bytes after the last sub-index",
            input.len()
        )));
    }
    store.seal();
    Ok(store)
}

fn read_partitioned(input: &mut &[u8]) -> Result<PartitionedIndexStore> {
    let version = read_u32(input, "version")?;
    if version != MV_VERSION {
        return Err(blob_error(format!("unsupported multi-view version {}", version)));
    }
    let partitions = read_u32(input, "partition count")? as usize;
    let label_arrays = read_u32(input, "label array count")? as usize;
    if partitions < 2 || label_arrays != partitions {
        return Err(blob_error(format!(
            "{} label arrays for {} partitions",
            label_arrays, partitions
        )));
    }

    let labels = (0..partitions)
        .map(|_| read_u32s(input, "label array"))
        .collect::<Result<Vec<_>>>()?;
    let index_rows_sum = read_u32s(input, "offset table")?;
    let label_to_internal_offset = read_u32s(input, "label offset table")?;

    let mut handles = Vec::with_capacity(partitions);
    for _ in 0..partitions {
        handles.push(read_native(input)?);
    }

    let layout = StoreLayout {
        labels,
        index_rows_sum,
        label_to_internal_offset,
    };
    PartitionedIndexStore::from_layout(layout, handles)
        .map_err(|e| blob_error(format!("inconsistent partition tables: {}", e)))
}

fn read_native(input: &mut &[u8]) -> Result<SubIndex> {
    read_sub_index(input).map_err(|e| {
        error!(target: "stratavec::index", error = %e, "Failed to decode sub-index");
        IndexError::from(e)
    })
}

fn read_u32(input: &mut &[u8], what: &str) -> Result<u32> {
    input
        .read_u32::<LittleEndian>()
        .map_err(|_| blob_error(format!("truncated {}", what)))
}

fn read_u32s(input: &mut &[u8], what: &str) -> Result<Vec<u32>> {
    let len = input
        .read_u64::<LittleEndian>()
        .map_err(|_| blob_error(format!("truncated {} length", what)))? as usize;
    if len.saturating_mul(4) > input.len() {
        return Err(blob_error(format!(
            "{} claims {} entries, {} bytes remain",
            what,
            len,
            input.len()
        )));
    }
    let mut out = vec![0u32; len];
    input
        .read_u32_into::<LittleEndian>(&mut out)
        .map_err(|_| blob_error(format!("truncated {}", what)))?;
    Ok(out)
}
