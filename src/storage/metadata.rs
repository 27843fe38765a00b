//! Segment metadata model, binary codec, and segment writer
//!
//! A serialized segment is a single `data` file:
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ TOC: u64 dataLen, u64 metaLen│   16 bytes
//! ├──────────────────────────────┤
//! │ Data block:                  │
//! │   per series, concatenated:  │
//! │     compressed(Gorilla bytes)│
//! ├──────────────────────────────┤
//! │ Meta block (compressed):     │
//! │   labels section             │
//! │   series section             │
//! │   u64 minTs, u64 maxTs       │
//! │   magic string               │
//! └──────────────────────────────┘
//! ```
//!
//! Series offsets are relative to the start of the data block; readers add
//! the TOC size when slicing the mapped file. A small `meta.json`
//! descriptor sits next to `data` so bootstrap can discover time bounds
//! without touching the mmap.

use crate::config::TsdbConfig;
use crate::label::LabelSet;
use crate::storage::compression::Compression;
use crate::storage::encoding::{DecBuf, EncBuf, U64_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::memory_segment::MemorySegment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Fixed ASCII tag trailing the meta block; validated on load.
pub const MAGIC: &str = "tessera.segment.v1";

/// Size of the table of contents: two u64 lengths.
pub const TOC_SIZE: usize = U64_SIZE * 2;

const END_OF_BLOCK: u8 = 0xff;

/// One series record in the metadata block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaSeries {
    pub sid: String,
    pub start_offset: u64,
    pub end_offset: u64,
    /// Ordinals into the labels section, ascending
    pub label_ordinals: Vec<u32>,
}

/// One labels-section record: a `"name/-/value"` key and the positional
/// ids of every series carrying it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesWithLabel {
    pub name: String,
    pub sids: Vec<u32>,
}

/// Decoded metadata block of one segment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub min_ts: i64,
    pub max_ts: i64,
    pub series: Vec<MetaSeries>,
    pub labels: Vec<SeriesWithLabel>,
}

/// Bootstrap descriptor written next to `data` as `meta.json`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentDesc {
    pub series_count: u64,
    pub data_points_count: u64,
    pub max_ts: i64,
    pub min_ts: i64,
}

/// Serialize the metadata block: labels section, series section, trailer,
/// then byte-compress. `sid_labels` carries the label set of each series
/// in `meta.series` order.
pub fn marshal_meta(
    meta: &Metadata,
    sid_labels: &[LabelSet],
    compression: Compression,
) -> Vec<u8> {
    let mut enc = EncBuf::new();

    // labels section; the record index becomes the label ordinal
    let mut label_ordered: HashMap<&str, u32> = HashMap::with_capacity(meta.labels.len());
    for (idx, record) in meta.labels.iter().enumerate() {
        label_ordered.insert(record.name.as_str(), idx as u32);
        enc.put_u8(record.name.len() as u8);
        enc.put_str(&record.name);
        enc.put_u32(record.sids.len() as u32);
        for &sid in &record.sids {
            enc.put_u32(sid);
        }
    }
    enc.put_u8(END_OF_BLOCK);

    // series section
    for (idx, series) in meta.series.iter().enumerate() {
        enc.put_u8(series.sid.len() as u8);
        enc.put_str(&series.sid);
        enc.put_u64(series.start_offset);
        enc.put_u64(series.end_offset);

        let mut ordinals: Vec<u32> = sid_labels[idx]
            .iter()
            .filter_map(|l| label_ordered.get(l.marshal_name().as_str()).copied())
            .collect();
        ordinals.sort_unstable();

        enc.put_u32(ordinals.len() as u32);
        for lid in ordinals {
            enc.put_u32(lid);
        }
    }
    enc.put_u8(END_OF_BLOCK);

    enc.put_u64(meta.min_ts as u64);
    enc.put_u64(meta.max_ts as u64);
    enc.put_str(MAGIC);

    compression.compress(enc.bytes())
}

/// Decompress and parse a metadata block, validating the magic trailer.
pub fn unmarshal_meta(data: &[u8], compression: Compression) -> StorageResult<Metadata> {
    let data = compression
        .decompress(data)
        .map_err(|_| StorageError::InvalidSize)?;

    if data.len() < MAGIC.len() {
        return Err(StorageError::InvalidSize);
    }
    if &data[data.len() - MAGIC.len()..] != MAGIC.as_bytes() {
        return Err(StorageError::Corruption("magic trailer mismatch".into()));
    }

    let mut dec = DecBuf::new(&data);
    let mut meta = Metadata::default();

    loop {
        let name_len = dec.get_u8();
        dec.err()?;
        if name_len == END_OF_BLOCK {
            break;
        }

        let name = dec.get_str(name_len as usize);
        let sid_count = dec.get_u32();
        dec.err()?;

        let mut sids = Vec::with_capacity(sid_count as usize);
        for _ in 0..sid_count {
            sids.push(dec.get_u32());
        }
        dec.err()?;

        meta.labels.push(SeriesWithLabel { name, sids });
    }

    loop {
        let sid_len = dec.get_u8();
        dec.err()?;
        if sid_len == END_OF_BLOCK {
            break;
        }

        let sid = dec.get_str(sid_len as usize);
        let start_offset = dec.get_u64();
        let end_offset = dec.get_u64();
        let label_count = dec.get_u32();
        dec.err()?;

        let mut label_ordinals = Vec::with_capacity(label_count as usize);
        for _ in 0..label_count {
            label_ordinals.push(dec.get_u32());
        }
        dec.err()?;

        meta.series.push(MetaSeries {
            sid,
            start_offset,
            end_offset,
            label_ordinals,
        });
    }

    meta.min_ts = dec.get_u64() as i64;
    meta.max_ts = dec.get_u64() as i64;
    dec.err()?;

    Ok(meta)
}

/// Marshal a whole memory segment into the `data` file image and its
/// descriptor.
///
/// The TOC is reserved first, each series' (possibly out-of-order-merged)
/// Gorilla stream is compressed and appended, the labels section is built
/// from the inverted index with sids rewritten to positional u32 ids, and
/// the TOC is patched last.
pub fn marshal_segment(segment: &MemorySegment) -> StorageResult<(Vec<u8>, SegmentDesc)> {
    let compression = segment.compression();
    let mut data_buf = vec![0u8; TOC_SIZE];

    let mut meta = Metadata {
        min_ts: segment.min_ts(),
        max_ts: segment.max_ts(),
        ..Default::default()
    };
    let mut sid_labels = Vec::new();
    let mut positions: HashMap<String, u32> = HashMap::new();
    let mut start_offset = 0u64;

    for (sid, series) in segment.series_snapshot() {
        positions.insert(sid.clone(), positions.len() as u32);
        sid_labels.push(series.labels().clone());

        let raw = match segment.outdated_snapshot(&sid) {
            Some(tree) => series.merged_bytes(&tree),
            None => series.encoded_bytes(),
        };
        let compressed = compression.compress(&raw);
        data_buf.extend_from_slice(&compressed);

        let end_offset = start_offset + compressed.len() as u64;
        meta.series.push(MetaSeries {
            sid,
            start_offset,
            end_offset,
            label_ordinals: Vec::new(),
        });
        start_offset = end_offset;
    }

    for (name, sids) in segment.index_entries() {
        let mut ordinals: Vec<u32> = sids
            .iter()
            .filter_map(|sid| positions.get(sid).copied())
            .collect();
        ordinals.sort_unstable();
        meta.labels.push(SeriesWithLabel { name, sids: ordinals });
    }

    let meta_bytes = marshal_meta(&meta, &sid_labels, compression);
    let data_len = (data_buf.len() - TOC_SIZE) as u64;
    let meta_len = meta_bytes.len() as u64;
    data_buf.extend_from_slice(&meta_bytes);

    data_buf[..U64_SIZE].copy_from_slice(&data_len.to_le_bytes());
    data_buf[U64_SIZE..TOC_SIZE].copy_from_slice(&meta_len.to_le_bytes());

    let desc = SegmentDesc {
        series_count: segment.series_count(),
        data_points_count: segment.points_count(),
        max_ts: segment.max_ts(),
        min_ts: segment.min_ts(),
    };

    Ok((data_buf, desc))
}

fn write_new_file(path: &Path, data: &[u8]) -> StorageResult<()> {
    if path.exists() {
        return Err(StorageError::InvalidSegment(format!(
            "{} already exists",
            path.display()
        )));
    }
    std::fs::write(path, data)?;
    Ok(())
}

/// Serialize a memory segment into `seg-<minTs>-<maxTs>/{data, meta.json}`
/// under the configured data path.
pub fn write_segment(segment: &MemorySegment, config: &TsdbConfig) -> StorageResult<()> {
    let (data, desc) = marshal_segment(segment)?;

    let dir = config.segment_dir(segment.min_ts(), segment.max_ts());
    std::fs::create_dir_all(&dir)?;

    write_new_file(&dir.join("data"), &data)?;
    write_new_file(&dir.join("meta.json"), &serde_json::to_vec_pretty(&desc)?)?;

    Ok(())
}

/// Read the TOC of a `data` file image.
pub fn read_toc(data: &[u8]) -> StorageResult<(u64, u64)> {
    if data.len() < TOC_SIZE {
        return Err(StorageError::InvalidSize);
    }
    let mut dec = DecBuf::new(&data[..TOC_SIZE]);
    let data_len = dec.get_u64();
    let meta_len = dec.get_u64();
    dec.err()?;
    Ok((data_len, meta_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::{join_separator, Label, METRIC_NAME};

    fn sample_meta() -> (Metadata, Vec<LabelSet>) {
        let labels = vec![
            SeriesWithLabel {
                name: join_separator(METRIC_NAME, "cpu.busy"),
                sids: vec![0, 1],
            },
            SeriesWithLabel {
                name: join_separator("core", "0"),
                sids: vec![0],
            },
            SeriesWithLabel {
                name: join_separator("core", "1"),
                sids: vec![1],
            },
        ];

        let mk = |core: &str| {
            let mut ls: LabelSet = [Label::new("core", core)].into_iter().collect();
            ls = ls.add_metric_name("cpu.busy");
            ls.sort();
            ls
        };

        let meta = Metadata {
            min_ts: 100,
            max_ts: 900,
            series: vec![
                MetaSeries {
                    sid: "1/-/2".into(),
                    start_offset: 0,
                    end_offset: 64,
                    label_ordinals: vec![],
                },
                MetaSeries {
                    sid: "1/-/3".into(),
                    start_offset: 64,
                    end_offset: 100,
                    label_ordinals: vec![],
                },
            ],
            labels,
        };
        (meta, vec![mk("0"), mk("1")])
    }

    #[test]
    fn test_meta_roundtrip() {
        let (meta, sid_labels) = sample_meta();
        for compression in [Compression::None, Compression::Lz4, Compression::Zstd] {
            let bytes = marshal_meta(&meta, &sid_labels, compression);
            let decoded = unmarshal_meta(&bytes, compression).unwrap();

            assert_eq!(decoded.min_ts, 100);
            assert_eq!(decoded.max_ts, 900);
            assert_eq!(decoded.labels, meta.labels);
            assert_eq!(decoded.series.len(), 2);
            assert_eq!(decoded.series[0].sid, "1/-/2");
            assert_eq!(decoded.series[0].end_offset, 64);
            // both series carry two labels, ordinals ascending
            assert_eq!(decoded.series[0].label_ordinals, vec![0, 1]);
            assert_eq!(decoded.series[1].label_ordinals, vec![0, 2]);
        }
    }

    #[test]
    fn test_magic_mismatch() {
        let (meta, sid_labels) = sample_meta();
        let mut bytes = marshal_meta(&meta, &sid_labels, Compression::None);
        let n = bytes.len();
        bytes[n - 1] ^= 0xff;

        assert!(matches!(
            unmarshal_meta(&bytes, Compression::None),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_truncated_meta() {
        let (meta, sid_labels) = sample_meta();
        let bytes = marshal_meta(&meta, &sid_labels, Compression::None);

        // keep the magic but cut the middle out
        let mut mangled = bytes[..4].to_vec();
        mangled.extend_from_slice(&bytes[bytes.len() - MAGIC.len()..]);
        assert!(unmarshal_meta(&mangled, Compression::None).is_err());

        assert!(matches!(
            unmarshal_meta(&bytes[..4], Compression::None),
            Err(StorageError::InvalidSize)
        ));
    }

    #[test]
    fn test_empty_meta_roundtrip() {
        let meta = Metadata {
            min_ts: 0,
            max_ts: 0,
            ..Default::default()
        };
        let bytes = marshal_meta(&meta, &[], Compression::None);
        let decoded = unmarshal_meta(&bytes, Compression::None).unwrap();
        assert!(decoded.series.is_empty());
        assert!(decoded.labels.is_empty());
    }

    #[test]
    fn test_toc_roundtrip() {
        let mut buf = vec![0u8; TOC_SIZE];
        buf[..8].copy_from_slice(&123u64.to_le_bytes());
        buf[8..16].copy_from_slice(&456u64.to_le_bytes());
        assert_eq!(read_toc(&buf).unwrap(), (123, 456));
        assert!(matches!(read_toc(&buf[..8]), Err(StorageError::InvalidSize)));
    }

    #[test]
    fn test_desc_json_field_names() {
        let desc = SegmentDesc {
            series_count: 2,
            data_points_count: 10,
            max_ts: 900,
            min_ts: 100,
        };
        let json = serde_json::to_string(&desc).unwrap();
        for field in ["seriesCount", "dataPointsCount", "maxTs", "minTs"] {
            assert!(json.contains(field), "missing {}", field);
        }
    }
}
