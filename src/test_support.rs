// Shared fixtures for unit tests

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::embeddings::EmbeddingProvider;
use crate::models::{Chunk, Document};
use crate::{RagError, Result};

/// Deterministic bag-of-words embedder that counts its calls.
#[derive(Debug)]
pub struct WordHashProvider {
    pub dimension: usize,
    pub calls: AtomicUsize,
    pub embedded: AtomicUsize,
    pub fail: bool,
}

impl WordHashProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            calls: AtomicUsize::new(0),
            embedded: AtomicUsize::new(0),
            fail: false,
        }
    }

    pub fn failing(dimension: usize) -> Self {
        Self {
            fail: true,
            ..Self::new(dimension)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.dimension];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let bucket = word
                .to_lowercase()
                .bytes()
                .fold(7_usize, |h, b| h.wrapping_mul(31).wrapping_add(usize::from(b)));
            vector[bucket % self.dimension] += 1.0;
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for WordHashProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(RagError::Embedding("provider unavailable".to_string()));
        }
        self.embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

pub fn document(doc_id: &str, title: &str, source_org: &str, pub_date: &str) -> Document {
    Document {
        doc_id: doc_id.to_string(),
        title: title.to_string(),
        content: format!("Full text of {title}"),
        source_url: format!("https://guidelines.example.org/{doc_id}"),
        source_org: source_org.to_string(),
        pub_date: pub_date.to_string(),
    }
}

/// Three guidelines with two chunks each.
pub fn corpus() -> (Vec<Document>, Vec<Chunk>) {
    let documents = vec![
        document("ng136", "Hypertension in adults", "NICE", "2019-08-28"),
        document("ng28", "Type 2 diabetes in adults", "NICE", "2015-12-02"),
        document("sign158", "Asthma management", "SIGN", "2019-07-01"),
    ];
    let chunks = vec![
        Chunk::new(
            &documents[0],
            0,
            "Diagnosis",
            "Hypertension diagnosis. ",
            "Measure clinic blood pressure in both arms.",
        ),
        Chunk::new(
            &documents[0],
            1,
            "Treatment",
            "Hypertension treatment. ",
            "Offer an ACE inhibitor or ARB as first step antihypertensive treatment.",
        ),
        Chunk::new(
            &documents[1],
            0,
            "Treatment",
            "Diabetes treatment. ",
            "Offer standard release metformin as initial drug treatment.",
        ),
        Chunk::new(
            &documents[1],
            1,
            "Monitoring",
            "Diabetes monitoring. ",
            "Measure HbA1c levels at 3 to 6 monthly intervals.",
        ),
        Chunk::new(
            &documents[2],
            0,
            "Treatment",
            "Asthma treatment. ",
            "Inhaled corticosteroids are the recommended preventer drug.",
        ),
        Chunk::new(
            &documents[2],
            1,
            "Diagnosis",
            "Asthma diagnosis. ",
            "Spirometry supports the diagnosis of asthma in adults.",
        ),
    ];
    (documents, chunks)
}
