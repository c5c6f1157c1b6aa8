use super::*;

fn sample_index() -> FlatIndex {
    FlatIndex::from_embeddings(
        3,
        &[
            vec![1.0, 0.0, 0.0],
            vec![0.0, 2.0, 0.0],
            vec![3.0, 3.0, 0.0],
            vec![0.0, 0.0, 5.0],
            vec![2.0, 0.0, 0.0],
        ],
    )
    .expect("index builds")
}

#[test]
fn vectors_are_normalized_on_insert() {
    let index = sample_index();
    assert_eq!(index.len(), 5);
    assert_eq!(index.dimension(), 3);
    let v = index.vector(1).expect("position exists");
    assert!((v[1] - 1.0).abs() < 1e-6);
    let norm: f32 = index
        .vector(2)
        .expect("position exists")
        .iter()
        .map(|x| x * x)
        .sum();
    assert!((norm - 1.0).abs() < 1e-6);
    assert!(index.vector(5).is_none());
}

#[test]
fn search_orders_by_cosine_with_stable_ties() {
    let index = sample_index();
    let hits = index
        .search(&[10.0, 0.0, 0.0], 3, |_| true)
        .expect("search works");

    let positions: Vec<usize> = hits.iter().map(|(p, _)| *p).collect();
    // Positions 0 and 4 are both parallel to the query; insertion order wins.
    assert_eq!(positions, vec![0, 4, 2]);
    assert!((hits[0].1 - 1.0).abs() < 1e-6);
    assert!((hits[2].1 - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
    assert!(hits.windows(2).all(|w| w[0].1 >= w[1].1));
}

#[test]
fn top_k_larger_than_index_returns_everything() {
    let index = sample_index();
    let hits = index.search(&[0.0, 1.0, 0.0], 1000, |_| true).expect("search");
    assert_eq!(hits.len(), 5);
    assert_eq!(hits[0].0, 1);
}

#[test]
fn zero_top_k_and_empty_index_return_nothing() {
    let index = sample_index();
    assert!(index.search(&[1.0, 0.0, 0.0], 0, |_| true).expect("search").is_empty());

    let empty = FlatIndex::new(3);
    assert!(empty.is_empty());
    assert!(empty.search(&[1.0, 0.0, 0.0], 5, |_| true).expect("search").is_empty());
}

#[test]
fn predicate_limits_candidates() {
    let index = sample_index();
    let hits = index
        .search(&[1.0, 0.0, 0.0], 2, |position| position % 2 == 1)
        .expect("search");
    let positions: Vec<usize> = hits.iter().map(|(p, _)| *p).collect();
    assert_eq!(positions, vec![1, 3]);
}

#[test]
fn dimension_mismatch_fails_fast() {
    let mut index = FlatIndex::new(3);
    assert!(matches!(
        index.add(&[1.0, 2.0]),
        Err(RagError::DimensionMismatch {
            expected: 3,
            actual: 2
        })
    ));
    assert!(index.is_empty());
    assert!(matches!(
        sample_index().search(&[1.0; 4], 1, |_| true),
        Err(RagError::DimensionMismatch { .. })
    ));
}

#[test]
fn index_bytes_round_trip() {
    let index = sample_index();
    let bytes = index.to_bytes();
    assert_eq!(&bytes[..4], b"MCIX");
    assert_eq!(FlatIndex::from_bytes(&bytes).expect("decodes"), index);
}

#[test]
fn embeddings_keep_raw_values() {
    let raw = vec![vec![3.0, 4.0], vec![-1.0, 0.5]];
    let bytes = encode_embeddings(2, &raw).expect("encodes");
    assert_eq!(&bytes[..4], b"MCEM");
    assert_eq!(decode_embeddings(&bytes).expect("decodes"), raw);
}

#[test]
fn corrupt_files_are_data_integrity_errors() {
    let bytes = sample_index().to_bytes();

    assert!(matches!(
        FlatIndex::from_bytes(&bytes[..10]),
        Err(RagError::DataIntegrity(_))
    ));
    assert!(matches!(
        FlatIndex::from_bytes(&bytes[..bytes.len() - 1]),
        Err(RagError::DataIntegrity(_))
    ));
    assert!(matches!(
        decode_embeddings(&bytes),
        Err(RagError::DataIntegrity(msg)) if msg.contains("magic")
    ));

    let mut wrong_version = bytes;
    wrong_version[4] = 9;
    assert!(matches!(
        FlatIndex::from_bytes(&wrong_version),
        Err(RagError::DataIntegrity(msg)) if msg.contains("version")
    ));
}
