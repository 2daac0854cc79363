//! End-to-end archive tests: compress a variant stream, decompress it, and
//! check byte identity plus the structural invariants of the archive.

use gts::archive::Archive;
use gts::{
    CompressedFile, DataEdge, DataFunction, DataGraph, Error, FieldValue, KeyDesc, KeyKind,
    SizeGraph, ValueType, VariantDesc,
};
use tempfile::TempDir;

fn info_key(key_id: u32, value_type: ValueType) -> KeyDesc {
    KeyDesc {
        key_id,
        kind: KeyKind::Info,
        value_type,
        arity: 0,
    }
}

fn gt_key(key_id: u32) -> KeyDesc {
    KeyDesc {
        key_id,
        kind: KeyKind::Format,
        value_type: ValueType::Int,
        arity: 0,
    }
}

fn variant(chrom: &str, pos: i64, id: &str) -> VariantDesc {
    VariantDesc {
        chrom: chrom.to_string(),
        pos,
        id: id.to_string(),
        ref_allele: "A".to_string(),
        alt: "T".to_string(),
        qual: "50".to_string(),
    }
}

fn int_field(v: i32) -> FieldValue {
    FieldValue::new(v.to_le_bytes().to_vec())
}

fn str_field(s: &str) -> FieldValue {
    FieldValue::new(s.as_bytes().to_vec())
}

/// Read every variant back out of an archive.
fn read_all(path: &std::path::Path) -> (Vec<VariantDesc>, Vec<Vec<FieldValue>>) {
    let mut cf = CompressedFile::new();
    cf.open_for_reading(path).unwrap();
    let mut descs = Vec::new();
    let mut all_fields = Vec::new();
    let mut desc = VariantDesc::default();
    let mut fields = Vec::new();
    while cf.get_variant(&mut desc, &mut fields).unwrap() {
        descs.push(desc.clone());
        all_fields.push(fields.clone());
    }
    assert!(cf.eof().unwrap());
    cf.close().unwrap();
    (descs, all_fields)
}

fn parts_of(path: &std::path::Path, stream: &str) -> Vec<Vec<u8>> {
    let ar = Archive::open(path).unwrap();
    let sid = ar.stream_id(stream).unwrap_or_else(|| panic!("no stream {stream}"));
    (0..ar.n_parts(sid) as u32)
        .map(|p| ar.read_part(sid, p).unwrap())
        .collect()
}

#[test]
fn test_roundtrip_single_int_key() {
    // One INFO integer key, both variants carrying 42.
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("s1.gts");

    let mut cf = CompressedFile::new();
    cf.open_for_writing(&path, 1).unwrap();
    cf.set_keys(vec![info_key(0, ValueType::Int)]).unwrap();
    cf.optimize_db(SizeGraph::default(), DataGraph::default())
        .unwrap();
    cf.set_variant(&variant("1", 100, "rs1"), vec![int_field(42)])
        .unwrap();
    cf.set_variant(&variant("1", 200, "rs2"), vec![int_field(42)])
        .unwrap();
    cf.close().unwrap();

    let (descs, fields) = read_all(&path);
    assert_eq!(descs.len(), 2);
    assert_eq!(descs[0], variant("1", 100, "rs1"));
    assert_eq!(descs[1], variant("1", 200, "rs2"));
    assert_eq!(fields[0][0], int_field(42));
    assert_eq!(fields[1][0], int_field(42));
}

#[test]
fn test_position_deltas_across_chromosomes() {
    // The position delta restarts at zero when the chromosome changes.
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("s2.gts");

    let mut cf = CompressedFile::new();
    cf.open_for_writing(&path, 0).unwrap();
    cf.set_keys(Vec::new()).unwrap();
    cf.set_variant(&variant("1", 100, "a"), Vec::new()).unwrap();
    cf.set_variant(&variant("1", 200, "b"), Vec::new()).unwrap();
    cf.set_variant(&variant("2", 100, "c"), Vec::new()).unwrap();
    cf.close().unwrap();

    let (descs, _) = read_all(&path);
    assert_eq!(
        descs.iter().map(|d| d.pos).collect::<Vec<_>>(),
        vec![100, 200, 100]
    );
    assert_eq!(
        descs.iter().map(|d| d.chrom.as_str()).collect::<Vec<_>>(),
        vec!["1", "1", "2"]
    );
}

#[test]
fn test_size_graph_shares_size_stream() {
    // Equal size streams collapse onto the lower key; the dependent's
    // size stream is never materialized.
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("s3.gts");

    let mut cf = CompressedFile::new();
    cf.open_for_writing(&path, 2).unwrap();
    cf.set_keys(vec![
        info_key(0, ValueType::String),
        info_key(1, ValueType::String),
    ])
    .unwrap();
    cf.optimize_db(SizeGraph::default(), DataGraph::default())
        .unwrap();
    // Sizes agree ([1, 1, 2]); the value mapping is inconsistent ("a" maps
    // to both "x" and "y"), so only the size graph links the keys.
    let rows = [("a", "x"), ("a", "y"), ("cd", "zw")];
    for (i, (v0, v1)) in rows.iter().enumerate() {
        cf.set_variant(
            &variant("1", 100 + i as i64, "."),
            vec![str_field(v0), str_field(v1)],
        )
        .unwrap();
    }
    cf.close().unwrap();

    assert_eq!(parts_of(&path, "key_1_size").len(), 0);
    assert_eq!(parts_of(&path, "key_0_size").len(), 1);
    assert_eq!(parts_of(&path, "key_1_data").len(), 1);

    let (_, fields) = read_all(&path);
    for (i, (v0, v1)) in rows.iter().enumerate() {
        assert_eq!(fields[i][0], str_field(v0));
        assert_eq!(fields[i][1], str_field(v1));
    }
}

#[test]
fn test_data_graph_identity_not_materialized() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ident.gts");

    let mut cf = CompressedFile::new();
    cf.open_for_writing(&path, 2).unwrap();
    cf.set_keys(vec![info_key(0, ValueType::Int), info_key(1, ValueType::Int)])
        .unwrap();
    cf.optimize_db(SizeGraph::default(), DataGraph::default())
        .unwrap();
    for i in 0..50 {
        let v = int_field(i * 3 - 7);
        cf.set_variant(&variant("1", 100 + i as i64, "."), vec![v.clone(), v])
            .unwrap();
    }
    cf.close().unwrap();

    assert_eq!(parts_of(&path, "key_1_data").len(), 0);
    assert_eq!(parts_of(&path, "key_1_size").len(), 0);

    let (_, fields) = read_all(&path);
    for (i, row) in fields.iter().enumerate() {
        assert_eq!(row[0], int_field(i as i32 * 3 - 7));
        assert_eq!(row[1], row[0]);
    }
}

#[test]
fn test_data_graph_constant_offset() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("offset.gts");

    let mut cf = CompressedFile::new();
    cf.open_for_writing(&path, 2).unwrap();
    cf.set_keys(vec![info_key(0, ValueType::Int), info_key(1, ValueType::Int)])
        .unwrap();
    cf.optimize_db(SizeGraph::default(), DataGraph::default())
        .unwrap();
    for i in 0..40 {
        cf.set_variant(
            &variant("1", 10 + i as i64, "."),
            vec![int_field(i), int_field(i + 1000)],
        )
        .unwrap();
    }
    cf.close().unwrap();

    assert_eq!(parts_of(&path, "key_1_data").len(), 0);

    let (_, fields) = read_all(&path);
    for (i, row) in fields.iter().enumerate() {
        assert_eq!(row[1], int_field(i as i32 + 1000));
    }
}

#[test]
fn test_gt_all_reference_compresses_hard() {
    // An all-reference cohort shrinks to well under 1% of raw size.
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("s4.gts");
    let n_variants = 8000usize;
    let nsp = 8usize; // 4 samples, ploidy 2

    let mut cf = CompressedFile::new();
    cf.open_for_writing(&path, 1).unwrap();
    cf.set_keys(vec![gt_key(0)]).unwrap();
    cf.set_no_samples(4).unwrap();
    cf.set_ploidy(2).unwrap();
    cf.set_gt_id(0).unwrap();
    cf.init_pbwt().unwrap();
    for i in 0..n_variants {
        cf.set_variant(
            &variant("1", i as i64, "."),
            vec![FieldValue::new(vec![0u8; nsp])],
        )
        .unwrap();
    }
    cf.close().unwrap();

    let raw_size = n_variants * nsp;
    let gt_bytes: usize = parts_of(&path, "key_0_data").iter().map(|p| p.len()).sum();
    assert!(
        gt_bytes * 100 < raw_size,
        "genotype stream is {gt_bytes} bytes for {raw_size} raw"
    );

    let (descs, fields) = read_all(&path);
    assert_eq!(descs.len(), n_variants);
    for row in &fields {
        assert_eq!(row[0].data, vec![0u8; nsp]);
    }
}

#[test]
fn test_gt_mixed_genotypes_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gtmix.gts");
    let nsp = 12usize; // 6 samples, ploidy 2

    let genotypes: Vec<Vec<u8>> = (0..500)
        .map(|i| (0..nsp).map(|k| ((i * 7 + k * 5) % 4) as u8).collect())
        .collect();

    let mut cf = CompressedFile::new();
    cf.open_for_writing(&path, 1).unwrap();
    cf.set_keys(vec![gt_key(0)]).unwrap();
    cf.set_no_samples(6).unwrap();
    cf.set_ploidy(2).unwrap();
    cf.set_gt_id(0).unwrap();
    cf.set_neglect_limit(2).unwrap();
    cf.init_pbwt().unwrap();
    for (i, gt) in genotypes.iter().enumerate() {
        cf.set_variant(
            &variant("1", i as i64, "."),
            vec![FieldValue::new(gt.clone())],
        )
        .unwrap();
    }
    cf.close().unwrap();

    let (_, fields) = read_all(&path);
    assert_eq!(fields.len(), genotypes.len());
    for (row, gt) in fields.iter().zip(genotypes.iter()) {
        assert_eq!(&row[0].data, gt);
    }
}

#[test]
fn test_truncated_archive_fails_cleanly() {
    // Removing the footer must produce a format error, not a crash.
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("s5.gts");

    let mut cf = CompressedFile::new();
    cf.open_for_writing(&path, 1).unwrap();
    cf.set_keys(vec![info_key(0, ValueType::Int)]).unwrap();
    for i in 0..100 {
        cf.set_variant(&variant("1", i, "."), vec![int_field(i as i32)])
            .unwrap();
    }
    cf.close().unwrap();

    let full = std::fs::read(&path).unwrap();
    std::fs::write(&path, &full[..full.len() - 16]).unwrap();

    let mut rd = CompressedFile::new();
    match rd.open_for_reading(&path) {
        Err(Error::Format(_)) => {}
        other => panic!("expected a format error, got {other:?}"),
    }
}

#[test]
fn test_parallel_compression_is_deterministic() {
    // Per-stream archive content is independent of the worker count.
    let write = |path: &std::path::Path, threads: u32| {
        let mut cf = CompressedFile::new();
        cf.open_for_writing(path, 3).unwrap();
        cf.set_no_threads(threads).unwrap();
        cf.set_keys(vec![
            gt_key(0),
            info_key(1, ValueType::Int),
            info_key(2, ValueType::String),
        ])
        .unwrap();
        cf.set_no_samples(4).unwrap();
        cf.set_ploidy(2).unwrap();
        cf.set_gt_id(0).unwrap();
        cf.init_pbwt().unwrap();
        for i in 0..10_000usize {
            let gt: Vec<u8> = (0..8).map(|k| ((i + k) % 3 == 0) as u8).collect();
            let name = format!("var_{:05}_{}", i, ["del", "ins", "snp"][i % 3]);
            cf.set_variant(
                &variant(if i < 6000 { "1" } else { "2" }, (i * 17) as i64, &name),
                vec![
                    FieldValue::new(gt),
                    int_field((i % 251) as i32),
                    str_field(&name),
                ],
            )
            .unwrap();
        }
        cf.close().unwrap();
    };

    let dir = TempDir::new().unwrap();
    let path_mt = dir.path().join("mt.gts");
    let path_st = dir.path().join("st.gts");
    write(&path_mt, 8);
    write(&path_st, 1);

    let ar = Archive::open(&path_mt).unwrap();
    let names: Vec<String> = ar.stream_stats().into_iter().map(|(n, _, _)| n).collect();
    drop(ar);
    assert!(!names.is_empty());
    for name in names {
        assert_eq!(
            parts_of(&path_mt, &name),
            parts_of(&path_st, &name),
            "stream {name} differs between thread counts"
        );
    }

    let (descs, fields) = read_all(&path_mt);
    assert_eq!(descs.len(), 10_000);
    assert_eq!(fields[9_999][1], int_field((9_999 % 251) as i32));
}

#[test]
fn test_schema_preservation() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("schema.gts");

    let keys = vec![
        info_key(0, ValueType::Flag),
        info_key(1, ValueType::Real),
        gt_key(2),
    ];
    let mut cf = CompressedFile::new();
    cf.open_for_writing(&path, 3).unwrap();
    cf.set_meta("source=unit-test".to_string()).unwrap();
    cf.set_header("##fileformat=VCFv4.3".to_string()).unwrap();
    cf.add_samples(vec!["HG001".into(), "HG002".into()]).unwrap();
    cf.add_samples(vec!["HG003".into()]).unwrap();
    cf.set_keys(keys.clone()).unwrap();
    cf.set_no_samples(3).unwrap();
    cf.set_ploidy(2).unwrap();
    cf.set_gt_id(2).unwrap();
    cf.set_neglect_limit(25).unwrap();
    cf.init_pbwt().unwrap();
    cf.set_variant(
        &variant("X", 1, "."),
        vec![
            FieldValue::new(vec![1]),
            FieldValue::new(1.5f32.to_le_bytes().to_vec()),
            FieldValue::new(vec![0u8; 6]),
        ],
    )
    .unwrap();
    cf.close().unwrap();

    let mut rd = CompressedFile::new();
    rd.open_for_reading(&path).unwrap();
    assert_eq!(rd.get_meta().unwrap(), "source=unit-test");
    assert_eq!(rd.get_header().unwrap(), "##fileformat=VCFv4.3");
    assert_eq!(rd.get_samples().unwrap(), &["HG001", "HG002", "HG003"]);
    assert_eq!(rd.get_keys().unwrap(), keys.as_slice());
    assert_eq!(rd.get_ploidy().unwrap(), 2);
    assert_eq!(rd.get_gt_id().unwrap(), Some(2));
    assert_eq!(rd.get_no_variants().unwrap(), 1);
    assert_eq!(rd.get_no_samples().unwrap(), 3);
    assert_eq!(rd.get_no_keys().unwrap(), 3);
    assert_eq!(rd.get_neglect_limit().unwrap(), 25);
    rd.close().unwrap();
}

#[test]
fn test_flag_and_real_fields_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("types.gts");

    let mut cf = CompressedFile::new();
    cf.open_for_writing(&path, 2).unwrap();
    cf.set_keys(vec![
        info_key(0, ValueType::Flag),
        info_key(1, ValueType::Real),
    ])
    .unwrap();
    for i in 0..30 {
        let flag = if i % 3 == 0 {
            FieldValue::new(vec![1])
        } else {
            FieldValue::absent()
        };
        let real = FieldValue::new((i as f32 * 0.25).to_le_bytes().to_vec());
        cf.set_variant(&variant("1", i, "."), vec![flag, real])
            .unwrap();
    }
    cf.close().unwrap();

    let (_, fields) = read_all(&path);
    for (i, row) in fields.iter().enumerate() {
        assert_eq!(row[0].present, i % 3 == 0);
        assert_eq!(
            row[1].data,
            (i as f32 * 0.25).to_le_bytes().to_vec()
        );
    }
}

#[test]
fn test_empty_present_field_distinct_from_absent() {
    // An explicitly-present empty value and an absent value are different
    // records; both must survive the round-trip exactly.
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("presence.gts");

    let rows = [
        FieldValue::new(Vec::new()), // present, empty
        FieldValue::absent(),
        FieldValue::new(b"x".to_vec()),
        FieldValue::new(Vec::new()),
        FieldValue::absent(),
    ];

    let mut cf = CompressedFile::new();
    cf.open_for_writing(&path, 1).unwrap();
    cf.set_keys(vec![info_key(0, ValueType::String)]).unwrap();
    for (i, f) in rows.iter().enumerate() {
        cf.set_variant(&variant("1", i as i64, "."), vec![f.clone()])
            .unwrap();
    }
    cf.close().unwrap();

    let (_, fields) = read_all(&path);
    assert_eq!(fields.len(), rows.len());
    for (row, expected) in fields.iter().zip(rows.iter()) {
        assert_eq!(&row[0], expected);
    }
    assert!(fields[0][0].present && fields[0][0].data.is_empty());
    assert!(!fields[1][0].present);
}

#[test]
fn test_multipart_text_stream() {
    // Values large enough to flush the 8 MiB buffer mid-stream, exercising
    // multi-part text decode and dictionary reuse across parts.
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("parts.gts");
    let n_variants = 2200usize;
    let value = |i: usize| format!("contig_assembly_{:04} {}", i % 17, "ACGT".repeat(1024));

    let mut cf = CompressedFile::new();
    cf.open_for_writing(&path, 1).unwrap();
    cf.set_keys(vec![info_key(0, ValueType::String)]).unwrap();
    for i in 0..n_variants {
        cf.set_variant(&variant("1", i as i64, "."), vec![str_field(&value(i))])
            .unwrap();
    }
    cf.close().unwrap();

    assert!(parts_of(&path, "key_0_data").len() > 1);

    let (_, fields) = read_all(&path);
    assert_eq!(fields.len(), n_variants);
    for (i, row) in fields.iter().enumerate() {
        assert_eq!(row[0].data, value(i).into_bytes());
    }
}

#[test]
fn test_explicit_graphs_applied() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("explicit.gts");

    let size_graph = SizeGraph {
        nodes: vec![(0, true), (1, false)],
        edges: vec![(0, 1)],
    };
    let data_graph = DataGraph {
        nodes: vec![(0, true), (1, false)],
        edges: vec![DataEdge {
            src: 0,
            dst: 1,
            func: DataFunction::Identity,
        }],
    };

    let mut cf = CompressedFile::new();
    cf.open_for_writing(&path, 2).unwrap();
    cf.set_keys(vec![info_key(0, ValueType::Int), info_key(1, ValueType::Int)])
        .unwrap();
    cf.optimize_db(size_graph, data_graph).unwrap();
    for i in 0..20 {
        let v = int_field(i * i);
        cf.set_variant(&variant("1", i as i64, "."), vec![v.clone(), v])
            .unwrap();
    }
    cf.close().unwrap();

    assert_eq!(parts_of(&path, "key_1_size").len(), 0);
    assert_eq!(parts_of(&path, "key_1_data").len(), 0);

    let (_, fields) = read_all(&path);
    for (i, row) in fields.iter().enumerate() {
        assert_eq!(row[1], int_field((i * i) as i32));
    }
}

#[test]
fn test_empty_archive_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("empty.gts");

    let mut cf = CompressedFile::new();
    cf.open_for_writing(&path, 1).unwrap();
    cf.set_keys(vec![info_key(0, ValueType::Int)]).unwrap();
    cf.close().unwrap();

    let mut rd = CompressedFile::new();
    rd.open_for_reading(&path).unwrap();
    assert_eq!(rd.get_no_variants().unwrap(), 0);
    assert!(rd.eof().unwrap());
    let mut desc = VariantDesc::default();
    let mut fields = Vec::new();
    assert!(!rd.get_variant(&mut desc, &mut fields).unwrap());
    rd.close().unwrap();
}

#[test]
fn test_api_misuse_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("misuse.gts");

    // Creating over an existing file fails.
    std::fs::write(&path, b"occupied").unwrap();
    let mut cf = CompressedFile::new();
    assert!(matches!(
        cf.open_for_writing(&path, 1),
        Err(Error::AlreadyExists(_))
    ));
    std::fs::remove_file(&path).unwrap();

    let mut cf = CompressedFile::new();
    cf.open_for_writing(&path, 2).unwrap();

    // Key table must match the declared count, ids must be dense.
    assert!(matches!(
        cf.set_keys(vec![info_key(0, ValueType::Int)]),
        Err(Error::Schema(_))
    ));
    assert!(matches!(
        cf.set_keys(vec![info_key(0, ValueType::Int), info_key(5, ValueType::Int)]),
        Err(Error::Schema(_))
    ));
    cf.set_keys(vec![info_key(0, ValueType::Int), info_key(1, ValueType::Int)])
        .unwrap();

    // Field count must match the schema.
    assert!(matches!(
        cf.set_variant(&variant("1", 1, "."), vec![int_field(1)]),
        Err(Error::Schema(_))
    ));

    cf.set_variant(&variant("1", 1, "."), vec![int_field(1), int_field(2)])
        .unwrap();

    // Setters after the first variant are lifecycle errors.
    assert!(matches!(cf.set_ploidy(2), Err(Error::State(_))));
    assert!(matches!(
        cf.set_meta("late".to_string()),
        Err(Error::State(_))
    ));

    cf.close().unwrap();
    assert!(matches!(cf.close(), Err(Error::State(_))));
}

#[test]
fn test_gt_arity_mismatch_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gtarity.gts");

    let mut cf = CompressedFile::new();
    cf.open_for_writing(&path, 1).unwrap();
    cf.set_keys(vec![gt_key(0)]).unwrap();
    cf.set_no_samples(4).unwrap();
    cf.set_ploidy(2).unwrap();
    cf.set_gt_id(0).unwrap();
    cf.init_pbwt().unwrap();
    assert!(matches!(
        cf.set_variant(&variant("1", 1, "."), vec![FieldValue::new(vec![0u8; 7])]),
        Err(Error::Schema(_))
    ));
}
