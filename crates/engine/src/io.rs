//! Native sub-index serialization
//!
//! ## Layout
//!
//! All integers are little-endian.
//!
//! ```text
//! fourcc      u32   HNFL | HNSQ | HNPQ | HNPR (codec of the base storage)
//! refined     u8    0 | 1
//! graph       m u32, ef_construction u32, entry flag u8, entry u32,
//!             max_level u32, rng_seed u64, rng_counter u64, nodes u64,
//!             per node: levels u32, per level: len u32, ids u32*len
//! storage     dim u32, metric u8, codec tag u8, codec params,
//!             ntotal u64, codes len u64 + bytes,
//!             inverse norms len u64 + f32*len
//! refine      storage section, present when refined == 1
//! ```

use byteorder::{LittleEndian, ReadBytesExt};
use stratavec_core::MetricType;

use crate::error::{EngineError, EngineResult};
use crate::graph::HnswGraph;
use crate::index::{HnswIndex, SubIndex};
use crate::quantizer::{ProductQuantizer, ResidualQuantizer, ScalarQuantizer, SqKind};
use crate::storage::{Codec, CodecKind, CodecStorage};

/// Fourcc of an HNSW index over fp32 storage
pub const FOURCC_FLAT: [u8; 4] = *b"HNFL";
/// Fourcc of an HNSW index over scalar quantized storage
pub const FOURCC_SQ: [u8; 4] = *b"HNSQ";
/// Fourcc of an HNSW index over product quantized storage
pub const FOURCC_PQ: [u8; 4] = *b"HNPQ";
/// Fourcc of an HNSW index over residual quantized storage
pub const FOURCC_PRQ: [u8; 4] = *b"HNPR";

const CODEC_FLAT: u8 = 0;
const CODEC_SQ: u8 = 1;
const CODEC_PQ: u8 = 2;
const CODEC_PRQ: u8 = 3;

fn fourcc_for(kind: CodecKind) -> [u8; 4] {
    match kind {
        CodecKind::Flat => FOURCC_FLAT,
        CodecKind::Sq => FOURCC_SQ,
        CodecKind::Pq => FOURCC_PQ,
        CodecKind::Prq => FOURCC_PRQ,
    }
}

fn metric_tag(metric: MetricType) -> u8 {
    match metric {
        MetricType::L2 => 0,
        MetricType::InnerProduct => 1,
        MetricType::Cosine => 2,
    }
}

fn metric_from_tag(tag: u8) -> EngineResult<MetricType> {
    match tag {
        0 => Ok(MetricType::L2),
        1 => Ok(MetricType::InnerProduct),
        2 => Ok(MetricType::Cosine),
        other => Err(EngineError::Corrupt(format!("unknown metric tag {}", other))),
    }
}

// =============================================================================
// Writing
// =============================================================================

/// Append the native encoding of `index` to `buf`
pub fn write_sub_index(index: &SubIndex, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&fourcc_for(index.kind()));
    buf.push(index.is_refined() as u8);
    write_graph(index.base().graph(), buf);
    write_storage(index.base().storage(), buf);
    if let Some(refine) = index.refine() {
        write_storage(refine, buf);
    }
}

fn write_graph(graph: &HnswGraph, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(graph.m as u32).to_le_bytes());
    buf.extend_from_slice(&(graph.ef_construction as u32).to_le_bytes());
    buf.push(graph.entry_point.is_some() as u8);
    buf.extend_from_slice(&graph.entry_point.unwrap_or(0).to_le_bytes());
    buf.extend_from_slice(&(graph.max_level as u32).to_le_bytes());
    buf.extend_from_slice(&graph.rng_seed.to_le_bytes());
    buf.extend_from_slice(&graph.rng_counter.to_le_bytes());
    buf.extend_from_slice(&(graph.links.len() as u64).to_le_bytes());
    for levels in &graph.links {
        buf.extend_from_slice(&(levels.len() as u32).to_le_bytes());
        for list in levels {
            buf.extend_from_slice(&(list.len() as u32).to_le_bytes());
            for &id in list {
                buf.extend_from_slice(&id.to_le_bytes());
            }
        }
    }
}

fn write_f32s(values: &[f32], buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(values.len() as u64).to_le_bytes());
    for &v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

fn write_pq(pq: &ProductQuantizer, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(pq.m as u32).to_le_bytes());
    buf.extend_from_slice(&(pq.nbits as u32).to_le_bytes());
    write_f32s(&pq.centroids, buf);
}

fn write_storage(storage: &CodecStorage, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(storage.dim as u32).to_le_bytes());
    buf.push(metric_tag(storage.metric));
    match &storage.codec {
        Codec::Flat => buf.push(CODEC_FLAT),
        Codec::Sq(sq) => {
            buf.push(CODEC_SQ);
            buf.push(sq.kind.tag());
            write_f32s(&sq.vmin, buf);
            write_f32s(&sq.vdiff, buf);
        }
        Codec::Pq(pq) => {
            buf.push(CODEC_PQ);
            write_pq(pq, buf);
        }
        Codec::Prq(rq) => {
            buf.push(CODEC_PRQ);
            buf.extend_from_slice(&(rq.stages.len() as u32).to_le_bytes());
            for stage in &rq.stages {
                write_pq(stage, buf);
            }
        }
    }
    buf.extend_from_slice(&(storage.ntotal as u64).to_le_bytes());
    buf.extend_from_slice(&(storage.codes.len() as u64).to_le_bytes());
    buf.extend_from_slice(&storage.codes);
    write_f32s(&storage.inv_norms, buf);
}

// =============================================================================
// Reading
// =============================================================================

fn truncated(what: &str) -> impl Fn(std::io::Error) -> EngineError + '_ {
    move |_| EngineError::Corrupt(format!("truncated {}", what))
}

fn read_u8(input: &mut &[u8], what: &str) -> EngineResult<u8> {
    input.read_u8().map_err(truncated(what))
}

fn read_u32(input: &mut &[u8], what: &str) -> EngineResult<u32> {
    input.read_u32::<LittleEndian>().map_err(truncated(what))
}

fn read_u64(input: &mut &[u8], what: &str) -> EngineResult<u64> {
    input.read_u64::<LittleEndian>().map_err(truncated(what))
}

/// Read a length prefix, rejecting lengths the remaining input cannot hold
fn read_len(input: &mut &[u8], elem_size: usize, what: &str) -> EngineResult<usize> {
    let len = read_u64(input, what)? as usize;
    if len.saturating_mul(elem_size) > input.len() {
        return Err(EngineError::Corrupt(format!(
            "{} claims {} elements, {} bytes remain",
            what,
            len,
            input.len()
        )));
    }
    Ok(len)
}

fn read_f32s(input: &mut &[u8], what: &str) -> EngineResult<Vec<f32>> {
    let len = read_len(input, 4, what)?;
    let mut out = vec![0.0f32; len];
    input
        .read_f32_into::<LittleEndian>(&mut out)
        .map_err(truncated(what))?;
    Ok(out)
}

/// Decode one sub-index from the front of `input`, advancing it
pub fn read_sub_index(input: &mut &[u8]) -> EngineResult<SubIndex> {
    let mut fourcc = [0u8; 4];
    if input.len() < 4 {
        return Err(EngineError::Corrupt("truncated fourcc".into()));
    }
    fourcc.copy_from_slice(&input[..4]);
    *input = &input[4..];
    let expected = match fourcc {
        FOURCC_FLAT => CodecKind::Flat,
        FOURCC_SQ => CodecKind::Sq,
        FOURCC_PQ => CodecKind::Pq,
        FOURCC_PRQ => CodecKind::Prq,
        other => {
            return Err(EngineError::UnrecognizedType {
                fourcc: u32::from_le_bytes(other),
                name: String::from_utf8_lossy(&other).into_owned(),
            })
        }
    };

    let refined = match read_u8(input, "refine flag")? {
        0 => false,
        1 => true,
        other => return Err(EngineError::Corrupt(format!("invalid refine flag {}", other))),
    };
    let graph = read_graph(input)?;
    let storage = read_storage(input)?;
    if storage.kind() != expected {
        return Err(EngineError::Corrupt(format!(
            "fourcc announces {:?} storage, found {:?}",
            expected,
            storage.kind()
        )));
    }
    if storage.ntotal != graph.links.len() {
        return Err(EngineError::Corrupt(format!(
            "graph has {} nodes, storage {} vectors",
            graph.links.len(),
            storage.ntotal
        )));
    }
    let base = HnswIndex { graph, storage };
    let refine = if refined {
        Some(read_storage(input)?)
    } else {
        None
    };
    SubIndex::new(base, refine).map_err(|e| EngineError::Corrupt(e.to_string()))
}

fn read_graph(input: &mut &[u8]) -> EngineResult<HnswGraph> {
    let m = read_u32(input, "graph header")? as usize;
    let ef_construction = read_u32(input, "graph header")? as usize;
    let has_entry = read_u8(input, "graph header")? != 0;
    let entry = read_u32(input, "graph header")?;
    let max_level = read_u32(input, "graph header")? as usize;
    let rng_seed = read_u64(input, "graph header")?;
    let rng_counter = read_u64(input, "graph header")?;
    let nodes = read_len(input, 4, "graph nodes")?;

    let mut links = Vec::with_capacity(nodes);
    for _ in 0..nodes {
        let levels = read_u32(input, "node levels")? as usize;
        if levels == 0 || levels > max_level + 1 {
            return Err(EngineError::Corrupt(format!(
                "node has {} levels, graph max level is {}",
                levels, max_level
            )));
        }
        let mut node = Vec::with_capacity(levels);
        for _ in 0..levels {
            let len = read_u32(input, "adjacency list")? as usize;
            if len * 4 > input.len() {
                return Err(EngineError::Corrupt("truncated adjacency list".into()));
            }
            let mut list = vec![0u32; len];
            input
                .read_u32_into::<LittleEndian>(&mut list)
                .map_err(truncated("adjacency list"))?;
            node.push(list);
        }
        links.push(node);
    }

    if links
        .iter()
        .flatten()
        .flatten()
        .any(|&id| id as usize >= nodes)
    {
        return Err(EngineError::Corrupt("neighbor id out of range".into()));
    }
    let entry_point = if has_entry {
        if entry as usize >= nodes {
            return Err(EngineError::Corrupt(format!("entry point {} out of range", entry)));
        }
        Some(entry)
    } else {
        None
    };

    Ok(HnswGraph {
        m,
        ef_construction,
        links,
        entry_point,
        max_level,
        rng_seed,
        rng_counter,
    })
}

fn read_pq(input: &mut &[u8], dim: usize) -> EngineResult<ProductQuantizer> {
    let m = read_u32(input, "pq header")? as usize;
    let nbits = read_u32(input, "pq header")? as usize;
    let centroids = read_f32s(input, "pq centroids")?;
    if m == 0 || dim % m != 0 || nbits == 0 || nbits > 8 || centroids.len() != dim << nbits {
        return Err(EngineError::Corrupt(format!(
            "inconsistent product quantizer m={} nbits={} centroids={}",
            m,
            nbits,
            centroids.len()
        )));
    }
    Ok(ProductQuantizer {
        dim,
        m,
        nbits,
        centroids,
    })
}

fn read_storage(input: &mut &[u8]) -> EngineResult<CodecStorage> {
    let dim = read_u32(input, "storage header")? as usize;
    if dim == 0 {
        return Err(EngineError::Corrupt("zero dimension".into()));
    }
    let metric = metric_from_tag(read_u8(input, "storage header")?)?;
    let codec = match read_u8(input, "codec tag")? {
        CODEC_FLAT => Codec::Flat,
        CODEC_SQ => {
            let kind = SqKind::from_tag(read_u8(input, "scalar quantizer")?)?;
            let vmin = read_f32s(input, "scalar quantizer range")?;
            let vdiff = read_f32s(input, "scalar quantizer range")?;
            let expected = if kind == SqKind::Sq8 { dim } else { 0 };
            if vmin.len() != expected || vdiff.len() != expected {
                return Err(EngineError::Corrupt("scalar quantizer range length".into()));
            }
            Codec::Sq(ScalarQuantizer {
                kind,
                dim,
                vmin,
                vdiff,
            })
        }
        CODEC_PQ => Codec::Pq(read_pq(input, dim)?),
        CODEC_PRQ => {
            let nrq = read_u32(input, "residual stages")? as usize;
            let stages = (0..nrq)
                .map(|_| read_pq(input, dim))
                .collect::<EngineResult<Vec<_>>>()?;
            if stages.is_empty() {
                return Err(EngineError::Corrupt("residual quantizer without stages".into()));
            }
            Codec::Prq(ResidualQuantizer { stages })
        }
        other => return Err(EngineError::Corrupt(format!("unknown codec tag {}", other))),
    };

    let mut storage = CodecStorage::new(dim, metric, codec);
    let ntotal = read_u64(input, "storage size")? as usize;
    let codes_len = read_len(input, 1, "codes")?;
    if codes_len != ntotal.saturating_mul(storage.code_size()) {
        return Err(EngineError::Corrupt(format!(
            "{} code bytes for {} vectors of {} bytes",
            codes_len,
            ntotal,
            storage.code_size()
        )));
    }
    storage.codes = input[..codes_len].to_vec();
    *input = &input[codes_len..];
    storage.inv_norms = read_f32s(input, "inverse norms")?;
    let expected_norms = if metric == MetricType::Cosine { ntotal } else { 0 };
    if storage.inv_norms.len() != expected_norms {
        return Err(EngineError::Corrupt("inverse norm count".into()));
    }
    storage.ntotal = ntotal;
    Ok(storage)
}
