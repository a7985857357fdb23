//! Key-vector resolver (C2): the ten read-only queries over an opened
//! [`ChunkedFile`](crate::chunked::ChunkedFile).
//!
//! Every queryable chunk holds a flat sequence of key-vector-indexed
//! records: `kv_count:u32, (key:u32,value:u32)*kv_count, payload_len:u32,
//! payload[payload_len]`. Domain identifiers that aren't part of the
//! caller-supplied GKV/CKV/TKV (subgraph ID, tag ID, proc domain, cal ID,
//! module ID) are folded into the same key vector using the reserved key
//! constants below, so the one matching rule below drives every query.

use crate::chunked::ChunkedFile;
use crate::error::{AcdbError, Result};
use crate::model::{
    CalKeyVector, GraphKeyVector, KeyValue, KeyVector, ModuleInstance, SubgraphConnection,
    SubgraphId, TagId, TagKeyVector,
};

/// Reserved key IDs folded into a record's key vector alongside the
/// caller-visible GKV/CKV/TKV pairs. Chosen out of the high range so they
/// never collide with a real calibration key.
pub const KEY_SGID: u32 = 0xF000_0001;
pub const KEY_TAG_ID: u32 = 0xF000_0002;
pub const KEY_PROC_DOMAIN: u32 = 0xF000_0003;
pub const KEY_CAL_ID: u32 = 0xF000_0004;
pub const KEY_MODULE_ID: u32 = 0xF000_0005;

// Chunk IDs. These name the well-known sections of an ACDB file; a real
// database ships all of them, a test fixture ships only what it exercises.
pub const CHUNK_GRAPH: u32 = 0x0001;
pub const CHUNK_SUBGRAPH_DATA: u32 = 0x0002;
pub const CHUNK_NONPERSIST_CAL: u32 = 0x0003;
pub const CHUNK_PERSIST_CAL_IDS: u32 = 0x0004;
pub const CHUNK_PERSIST_CAL: u32 = 0x0005;
pub const CHUNK_TAGGED_MODULES: u32 = 0x0006;
pub const CHUNK_TAG_DATA: u32 = 0x0007;
pub const CHUNK_GRAPH_ALIAS: u32 = 0x0008;
pub const CHUNK_DRIVER_DATA: u32 = 0x0009;

/// `get_graph`'s decoded output.
#[derive(Debug, Clone, Default)]
pub struct GraphDef {
    pub sg_ids: Vec<SubgraphId>,
    pub connections: Vec<SubgraphConnection>,
}

/// A single `{iid, pid, size, errcode, payload[size]}` calibration record.
#[derive(Debug, Clone)]
pub struct CalRecord {
    pub iid: u32,
    pub pid: u32,
    pub errcode: i32,
    pub payload: Vec<u8>,
}

/// One row of `get_persist_cal_ids`'s output.
#[derive(Debug, Clone)]
pub struct PersistCalIds {
    pub cal_id: u32,
    pub iids: Vec<u32>,
}

struct Record {
    kv: KeyVector,
    payload: Vec<u8>,
}

fn parse_records(bytes: &[u8]) -> Result<Vec<Record>> {
    let mut out = Vec::new();
    let mut cursor = 0usize;
    while cursor < bytes.len() {
        let kv_count = read_u32(bytes, &mut cursor)? as usize;
        let mut pairs = Vec::with_capacity(kv_count);
        for _ in 0..kv_count {
            let key = read_u32(bytes, &mut cursor)?;
            let value = read_u32(bytes, &mut cursor)?;
            pairs.push(KeyValue::new(key, value));
        }
        let payload_len = read_u32(bytes, &mut cursor)? as usize;
        let end = cursor
            .checked_add(payload_len)
            .filter(|&e| e <= bytes.len())
            .ok_or(AcdbError::Failed)?;
        let payload = bytes[cursor..end].to_vec();
        cursor = end;
        out.push(Record {
            kv: KeyVector::new(pairs),
            payload,
        });
    }
    Ok(out)
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    let end = cursor.checked_add(4).filter(|&e| e <= bytes.len()).ok_or(AcdbError::Failed)?;
    let v = u32::from_le_bytes(bytes[*cursor..end].try_into().unwrap());
    *cursor = end;
    Ok(v)
}

/// Picks the most-specific record matching `query`, applying a
/// most-specific-wins tie-break. Two equally-specific matches are a
/// database-build error and surface as `FAILED`.
fn best_match<'a>(records: &'a [Record], query: &KeyVector) -> Result<Option<&'a Record>> {
    let mut best: Option<&Record> = None;
    let mut tie = false;
    for r in records {
        if !r.kv.matches(query) {
            continue;
        }
        match &best {
            None => best = Some(r),
            Some(b) => match r.kv.specificity().cmp(&b.kv.specificity()) {
                std::cmp::Ordering::Greater => {
                    best = Some(r);
                    tie = false;
                }
                std::cmp::Ordering::Equal => tie = true,
                std::cmp::Ordering::Less => {}
            },
        }
    }
    if tie {
        return Err(AcdbError::Failed);
    }
    Ok(best)
}

/// Writes `payload` to `out` following the two-call size-negotiation idiom
/// from the design notes: a `None` buffer or a too-small buffer both report
/// `NeedMore { needed }`; only an adequately sized buffer actually copies.
fn write_sized(payload: &[u8], out: Option<&mut [u8]>) -> Result<usize> {
    match out {
        None => Err(AcdbError::NeedMore {
            needed: payload.len(),
        }),
        Some(buf) if buf.len() < payload.len() => Err(AcdbError::NeedMore {
            needed: payload.len(),
        }),
        Some(buf) => {
            buf[..payload.len()].copy_from_slice(payload);
            Ok(payload.len())
        }
    }
}

/// Read-only view over an opened database that answers its ten supported
/// key-vector queries.
#[derive(Debug, Clone)]
pub struct Resolver {
    file: ChunkedFile,
}

impl Resolver {
    pub fn new(file: ChunkedFile) -> Self {
        Self { file }
    }

    fn records_in(&self, chunk_id: u32) -> Result<Vec<Record>> {
        let bytes = self.file.chunk_bytes(chunk_id).map_err(AcdbError::from)?;
        parse_records(bytes)
    }

    /// Returns the subgraph list and sg-to-sg connections for a topology.
    pub fn get_graph(&self, gkv: &GraphKeyVector) -> Result<GraphDef> {
        let records = self.records_in(CHUNK_GRAPH)?;
        let rec = best_match(&records, &gkv.0)?.ok_or(AcdbError::NotExist)?;
        decode_graph_def(&rec.payload)
    }

    /// Opaque container + module-connection payload for the given
    /// subgraphs under `gkv`. Two-call size negotiation: pass `out: None`
    /// (or too small a slice) to learn the required size via `NeedMore`.
    pub fn get_subgraph_data(
        &self,
        sg_ids: &[SubgraphId],
        gkv: &GraphKeyVector,
        out: Option<&mut [u8]>,
    ) -> Result<usize> {
        let records = self.records_in(CHUNK_SUBGRAPH_DATA)?;
        let mut combined = Vec::new();
        for sg_id in sg_ids {
            let query = query_with_sgid(&gkv.0, *sg_id);
            let rec = best_match(&records, &query)?.ok_or(AcdbError::NotExist)?;
            combined.extend_from_slice(&rec.payload);
        }
        write_sized(&combined, out)
    }

    /// Calibration blob records for `sg_ids`, sorted ascending by
    /// `(iid, pid)` so identical CKVs over the same subgraph set produce
    /// byte-identical output (required for on-wire caching). `prior_ckv`
    /// is accepted to mirror the on-wire contract (a future delta-only
    /// encoding could diff against it) but the full record set for
    /// `new_ckv` is always what's returned.
    pub fn get_nonpersist_cal(
        &self,
        sg_ids: &[SubgraphId],
        _prior_ckv: &CalKeyVector,
        new_ckv: &CalKeyVector,
    ) -> Result<Vec<CalRecord>> {
        let records = self.records_in(CHUNK_NONPERSIST_CAL)?;
        let mut out = Vec::new();
        for sg_id in sg_ids {
            let query = query_with_sgid(&new_ckv.0, *sg_id);
            for rec in &records {
                if rec.kv.matches(&query) {
                    out.push(decode_cal_record(&rec.payload)?);
                }
            }
        }
        out.sort_by_key(|r| (r.iid, r.pid));
        Ok(out)
    }

    /// `(cal_id, iid[])` pairs for `sg_ids` under `ckv`.
    pub fn get_persist_cal_ids(
        &self,
        sg_ids: &[SubgraphId],
        ckv: &CalKeyVector,
    ) -> Result<Vec<PersistCalIds>> {
        let records = self.records_in(CHUNK_PERSIST_CAL_IDS)?;
        let mut out = Vec::new();
        for sg_id in sg_ids {
            let query = query_with_sgid(&ckv.0, *sg_id);
            for rec in &records {
                if rec.kv.matches(&query) {
                    out.push(decode_persist_cal_ids(&rec.payload)?);
                }
            }
        }
        Ok(out)
    }

    /// Persistent calibration blob for `cal_id` on processor `proc_domain`.
    pub fn get_persist_cal(
        &self,
        cal_id: u32,
        proc_domain: u8,
        out: Option<&mut [u8]>,
    ) -> Result<usize> {
        let records = self.records_in(CHUNK_PERSIST_CAL)?;
        let query = KeyVector::new(vec![
            KeyValue::new(KEY_CAL_ID, cal_id),
            KeyValue::new(KEY_PROC_DOMAIN, proc_domain as u32),
        ]);
        let rec = best_match(&records, &query)?.ok_or(AcdbError::NotExist)?;
        write_sized(&rec.payload, out)
    }

    /// `(mid, iid)` pairs tagged `tag_id` for `sg_ids` on `proc_domain`.
    pub fn get_tagged_modules(
        &self,
        sg_ids: &[SubgraphId],
        tag_id: TagId,
        proc_domain: u8,
    ) -> Result<Vec<ModuleInstance>> {
        let records = self.records_in(CHUNK_TAGGED_MODULES)?;
        let mut out = Vec::new();
        for sg_id in sg_ids {
            let query = KeyVector::new(vec![
                KeyValue::new(KEY_SGID, sg_id.0),
                KeyValue::new(KEY_TAG_ID, tag_id.0),
                KeyValue::new(KEY_PROC_DOMAIN, proc_domain as u32),
            ]);
            for rec in &records {
                if rec.kv.matches(&query) {
                    out.extend(decode_module_instances(&rec.payload)?);
                }
            }
        }
        Ok(out)
    }

    /// Parameter payload for modules tagged `tag_id` under `tkv`.
    pub fn get_tag_data(
        &self,
        sg_ids: &[SubgraphId],
        tag_id: TagId,
        tkv: &TagKeyVector,
        out: Option<&mut [u8]>,
    ) -> Result<usize> {
        let records = self.records_in(CHUNK_TAG_DATA)?;
        let mut combined = Vec::new();
        for sg_id in sg_ids {
            let mut query = query_with_sgid(&tkv.0, *sg_id);
            query.0.push(KeyValue::new(KEY_TAG_ID, tag_id.0));
            let rec = best_match(&records, &query)?.ok_or(AcdbError::NotExist)?;
            combined.extend_from_slice(&rec.payload);
        }
        write_sized(&combined, out)
    }

    /// Short human-readable alias (≤255 bytes) for a topology.
    pub fn get_graph_alias(&self, gkv: &GraphKeyVector, out: Option<&mut [u8]>) -> Result<usize> {
        let records = self.records_in(CHUNK_GRAPH_ALIAS)?;
        let rec = best_match(&records, &gkv.0)?.ok_or(AcdbError::NotExist)?;
        if rec.payload.len() > 255 {
            return Err(AcdbError::Failed);
        }
        write_sized(&rec.payload, out)
    }

    /// Every GKV in the database whose key set is a superset of
    /// `key_id_subset`.
    pub fn get_supported_gkvs(&self, key_id_subset: &[u32]) -> Result<Vec<GraphKeyVector>> {
        let records = self.records_in(CHUNK_GRAPH)?;
        let mut out = Vec::new();
        for rec in &records {
            if key_id_subset.iter().all(|k| rec.kv.keys().any(|rk| rk == *k)) {
                out.push(GraphKeyVector(rec.kv.clone()));
            }
        }
        Ok(out)
    }

    /// Driver-scoped payload for host-side use, keyed by `module_id` plus
    /// an arbitrary caller key vector.
    pub fn get_driver_data(
        &self,
        module_id: u32,
        kv: &KeyVector,
        out: Option<&mut [u8]>,
    ) -> Result<usize> {
        let records = self.records_in(CHUNK_DRIVER_DATA)?;
        let mut query = kv.clone();
        query.0.push(KeyValue::new(KEY_MODULE_ID, module_id));
        let rec = best_match(&records, &query)?.ok_or(AcdbError::NotExist)?;
        write_sized(&rec.payload, out)
    }
}

fn query_with_sgid(base: &KeyVector, sg_id: SubgraphId) -> KeyVector {
    let mut pairs = base.0.clone();
    pairs.push(KeyValue::new(KEY_SGID, sg_id.0));
    KeyVector::new(pairs)
}

fn decode_graph_def(payload: &[u8]) -> Result<GraphDef> {
    let mut cursor = 0usize;
    let sg_count = read_u32(payload, &mut cursor)? as usize;
    let mut sg_ids = Vec::with_capacity(sg_count);
    for _ in 0..sg_count {
        sg_ids.push(SubgraphId(read_u32(payload, &mut cursor)?));
    }
    let conn_count = read_u32(payload, &mut cursor)? as usize;
    let mut connections = Vec::with_capacity(conn_count);
    for _ in 0..conn_count {
        let src = SubgraphId(read_u32(payload, &mut cursor)?);
        let dst = SubgraphId(read_u32(payload, &mut cursor)?);
        let len = read_u32(payload, &mut cursor)? as usize;
        let end = cursor
            .checked_add(len)
            .filter(|&e| e <= payload.len())
            .ok_or(AcdbError::Failed)?;
        let data = payload[cursor..end].to_vec();
        cursor = end;
        connections.push(SubgraphConnection {
            src_sg_id: src,
            dst_sg_id: dst,
            payload: data,
        });
    }
    Ok(GraphDef { sg_ids, connections })
}

fn decode_cal_record(payload: &[u8]) -> Result<CalRecord> {
    let mut cursor = 0usize;
    let iid = read_u32(payload, &mut cursor)?;
    let pid = read_u32(payload, &mut cursor)?;
    let errcode = read_u32(payload, &mut cursor)? as i32;
    let size = read_u32(payload, &mut cursor)? as usize;
    let end = cursor
        .checked_add(size)
        .filter(|&e| e <= payload.len())
        .ok_or(AcdbError::Failed)?;
    let data = payload[cursor..end].to_vec();
    Ok(CalRecord {
        iid,
        pid,
        errcode,
        payload: data,
    })
}

fn decode_persist_cal_ids(payload: &[u8]) -> Result<PersistCalIds> {
    let mut cursor = 0usize;
    let cal_id = read_u32(payload, &mut cursor)?;
    let count = read_u32(payload, &mut cursor)? as usize;
    let mut iids = Vec::with_capacity(count);
    for _ in 0..count {
        iids.push(read_u32(payload, &mut cursor)?);
    }
    Ok(PersistCalIds { cal_id, iids })
}

fn decode_module_instances(payload: &[u8]) -> Result<Vec<ModuleInstance>> {
    let mut cursor = 0usize;
    let count = read_u32(payload, &mut cursor)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let module_id = read_u32(payload, &mut cursor)?;
        let instance_id = read_u32(payload, &mut cursor)?;
        out.push(ModuleInstance {
            module_id,
            instance_id,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::KeyValue;

    fn record_bytes(kv: &[(u32, u32)], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(kv.len() as u32).to_le_bytes());
        for (k, v) in kv {
            out.extend_from_slice(&k.to_le_bytes());
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn graph_payload(sg_ids: &[u32]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(sg_ids.len() as u32).to_le_bytes());
        for id in sg_ids {
            out.extend_from_slice(&id.to_le_bytes());
        }
        out.extend_from_slice(&0u32.to_le_bytes()); // zero connections
        out
    }

    fn build_db(chunks: &[(u32, Vec<u8>)]) -> ChunkedFile {
        let mut payload = Vec::new();
        let mut descs = Vec::new();
        for (id, data) in chunks {
            descs.push((*id, payload.len() as u32, data.len() as u32));
            payload.extend_from_slice(data);
        }
        let mut out = Vec::new();
        out.extend_from_slice(&0x4143_4442u32.to_le_bytes());
        out.extend_from_slice(&(descs.len() as u32).to_le_bytes());
        let header_and_dir_len = 8 + descs.len() * 12;
        for (id, offset, size) in &descs {
            out.extend_from_slice(&id.to_le_bytes());
            out.extend_from_slice(&(offset + header_and_dir_len as u32).to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
        }
        out.extend_from_slice(&payload);
        ChunkedFile::from_bytes(out.into()).unwrap()
    }

    #[test]
    fn get_graph_resolves_by_gkv() {
        let rec = record_bytes(&[(1, 100)], &graph_payload(&[10, 11]));
        let db = build_db(&[(CHUNK_GRAPH, rec)]);
        let resolver = Resolver::new(db);
        let gkv = GraphKeyVector::new(vec![KeyValue::new(1, 100)]);
        let graph = resolver.get_graph(&gkv).unwrap();
        assert_eq!(graph.sg_ids, vec![SubgraphId(10), SubgraphId(11)]);
    }

    #[test]
    fn get_graph_missing_is_not_exist() {
        let rec = record_bytes(&[(1, 100)], &graph_payload(&[10]));
        let db = build_db(&[(CHUNK_GRAPH, rec)]);
        let resolver = Resolver::new(db);
        let gkv = GraphKeyVector::new(vec![KeyValue::new(1, 999)]);
        assert!(matches!(resolver.get_graph(&gkv), Err(AcdbError::NotExist)));
    }

    #[test]
    fn missing_chunk_is_not_exist() {
        let db = build_db(&[]);
        let resolver = Resolver::new(db);
        let gkv = GraphKeyVector::new(vec![KeyValue::new(1, 100)]);
        assert!(matches!(resolver.get_graph(&gkv), Err(AcdbError::NotExist)));
    }

    #[test]
    fn ambiguous_tie_is_failed() {
        let rec1 = record_bytes(&[(1, 100)], &graph_payload(&[1]));
        let rec2 = record_bytes(&[(1, 100)], &graph_payload(&[2]));
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&rec1);
        bytes.extend_from_slice(&rec2);
        let db = build_db(&[(CHUNK_GRAPH, bytes)]);
        let resolver = Resolver::new(db);
        let gkv = GraphKeyVector::new(vec![KeyValue::new(1, 100)]);
        assert!(matches!(resolver.get_graph(&gkv), Err(AcdbError::Failed)));
    }

    #[test]
    fn most_specific_row_wins() {
        let general = record_bytes(&[(1, 100)], &graph_payload(&[1]));
        let specific = record_bytes(&[(1, 100), (2, 5)], &graph_payload(&[2]));
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&general);
        bytes.extend_from_slice(&specific);
        let db = build_db(&[(CHUNK_GRAPH, bytes)]);
        let resolver = Resolver::new(db);
        let gkv = GraphKeyVector::new(vec![KeyValue::new(1, 100), KeyValue::new(2, 5)]);
        let graph = resolver.get_graph(&gkv).unwrap();
        assert_eq!(graph.sg_ids, vec![SubgraphId(2)]);
    }

    #[test]
    fn subgraph_data_needmore_on_null_buffer() {
        let rec = record_bytes(&[(1, 100), (KEY_SGID, 7)], b"abcdef");
        let db = build_db(&[(CHUNK_SUBGRAPH_DATA, rec)]);
        let resolver = Resolver::new(db);
        let gkv = GraphKeyVector::new(vec![KeyValue::new(1, 100)]);
        let err = resolver
            .get_subgraph_data(&[SubgraphId(7)], &gkv, None)
            .unwrap_err();
        assert!(matches!(err, AcdbError::NeedMore { needed: 6 }));
    }

    #[test]
    fn subgraph_data_fills_adequate_buffer() {
        let rec = record_bytes(&[(1, 100), (KEY_SGID, 7)], b"abcdef");
        let db = build_db(&[(CHUNK_SUBGRAPH_DATA, rec)]);
        let resolver = Resolver::new(db);
        let gkv = GraphKeyVector::new(vec![KeyValue::new(1, 100)]);
        let mut buf = vec![0u8; 6];
        let n = resolver
            .get_subgraph_data(&[SubgraphId(7)], &gkv, Some(&mut buf))
            .unwrap();
        assert_eq!(n, 6);
        assert_eq!(&buf, b"abcdef");
    }

    #[test]
    fn nonpersist_cal_sorted_by_iid_pid() {
        let r1 = record_bytes(
            &[(KEY_SGID, 1)],
            &{
                let mut p = Vec::new();
                p.extend_from_slice(&2u32.to_le_bytes()); // iid
                p.extend_from_slice(&1u32.to_le_bytes()); // pid
                p.extend_from_slice(&0u32.to_le_bytes()); // errcode
                p.extend_from_slice(&0u32.to_le_bytes()); // size
                p
            },
        );
        let r2 = record_bytes(
            &[(KEY_SGID, 1)],
            &{
                let mut p = Vec::new();
                p.extend_from_slice(&1u32.to_le_bytes());
                p.extend_from_slice(&9u32.to_le_bytes());
                p.extend_from_slice(&0u32.to_le_bytes());
                p.extend_from_slice(&0u32.to_le_bytes());
                p
            },
        );
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&r1);
        bytes.extend_from_slice(&r2);
        let db = build_db(&[(CHUNK_NONPERSIST_CAL, bytes)]);
        let resolver = Resolver::new(db);
        let ckv = CalKeyVector::default();
        let recs = resolver
            .get_nonpersist_cal(&[SubgraphId(1)], &ckv, &ckv)
            .unwrap();
        assert_eq!(recs[0].iid, 1);
        assert_eq!(recs[1].iid, 2);
    }
}
