//! Queries used for delete-by-query and snapshot lookups.
//!
//! Scoring is outside this crate. A query only has to resolve to the set of
//! matching document ids of one segment, and to name itself through
//! [`Query::key`] so that buffering the same query twice keeps one entry.

use std::fmt::Debug;

use crate::document::Term;
use crate::error::Result;
use crate::index::segment_reader::SegmentReader;

/// Trait for queries resolvable against a single segment.
pub trait Query: Send + Sync + Debug {
    /// Matching segment-local document ids, ascending. Deleted documents are
    /// not filtered out.
    fn doc_ids(&self, reader: &SegmentReader) -> Result<Vec<u32>>;

    /// Canonical identity of the query.
    fn key(&self) -> String;

    /// Clone this query.
    fn clone_box(&self) -> Box<dyn Query>;
}

impl Clone for Box<dyn Query> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// A query that matches documents containing a specific term.
#[derive(Debug, Clone)]
pub struct TermQuery {
    term: Term,
}

impl TermQuery {
    pub fn new(term: Term) -> Self {
        TermQuery { term }
    }

    /// Get the term.
    pub fn term(&self) -> &Term {
        &self.term
    }
}

impl Query for TermQuery {
    fn doc_ids(&self, reader: &SegmentReader) -> Result<Vec<u32>> {
        Ok(reader.postings(&self.term).to_vec())
    }

    fn key(&self) -> String {
        format!("term({})", self.term)
    }

    fn clone_box(&self) -> Box<dyn Query> {
        Box::new(self.clone())
    }
}

/// Matches documents whose numeric value lies in `[min, max]`. An open bound
/// is `None`. Documents without a value never match.
#[derive(Debug, Clone)]
pub struct NumericRangeQuery {
    field: String,
    min: Option<i64>,
    max: Option<i64>,
}

impl NumericRangeQuery {
    pub fn new<S: Into<String>>(field: S, min: Option<i64>, max: Option<i64>) -> Self {
        NumericRangeQuery {
            field: field.into(),
            min,
            max,
        }
    }

    fn accepts(&self, value: i64) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }
}

impl Query for NumericRangeQuery {
    fn doc_ids(&self, reader: &SegmentReader) -> Result<Vec<u32>> {
        let Some(values) = reader.numeric_values(&self.field) else {
            return Ok(Vec::new());
        };
        Ok(values
            .iter()
            .enumerate()
            .filter_map(|(doc, value)| match value {
                Some(v) if self.accepts(*v) => Some(doc as u32),
                _ => None,
            })
            .collect())
    }

    fn key(&self) -> String {
        let bound = |b: Option<i64>| b.map_or_else(|| "*".to_string(), |v| v.to_string());
        format!("range({}:[{} TO {}])", self.field, bound(self.min), bound(self.max))
    }

    fn clone_box(&self) -> Box<dyn Query> {
        Box::new(self.clone())
    }
}

/// Matches every document slot.
#[derive(Debug, Clone, Default)]
pub struct MatchAllDocsQuery;

impl Query for MatchAllDocsQuery {
    fn doc_ids(&self, reader: &SegmentReader) -> Result<Vec<u32>> {
        Ok((0..reader.max_doc()).collect())
    }

    fn key(&self) -> String {
        "*:*".to_string()
    }

    fn clone_box(&self) -> Box<dyn Query> {
        Box::new(self.clone())
    }
}

/// Conjunction/disjunction over sub-queries.
///
/// A document matches when it matches every `must` clause, none of the
/// `must_not` clauses, and at least one `should` clause if there are no
/// `must` clauses.
#[derive(Debug, Clone, Default)]
pub struct BooleanQuery {
    must: Vec<Box<dyn Query>>,
    should: Vec<Box<dyn Query>>,
    must_not: Vec<Box<dyn Query>>,
}

impl BooleanQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn must(mut self, query: Box<dyn Query>) -> Self {
        self.must.push(query);
        self
    }

    pub fn should(mut self, query: Box<dyn Query>) -> Self {
        self.should.push(query);
        self
    }

    pub fn must_not(mut self, query: Box<dyn Query>) -> Self {
        self.must_not.push(query);
        self
    }
}

fn intersect(a: &[u32], b: &[u32]) -> Vec<u32> {
    let (mut i, mut j) = (0, 0);
    let mut out = Vec::new();
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

impl Query for BooleanQuery {
    fn doc_ids(&self, reader: &SegmentReader) -> Result<Vec<u32>> {
        let mut matched: Option<Vec<u32>> = None;

        for clause in &self.must {
            let docs = clause.doc_ids(reader)?;
            matched = Some(match matched {
                Some(current) => intersect(&current, &docs),
                None => docs,
            });
        }

        if matched.is_none() {
            if self.should.is_empty() {
                return Ok(Vec::new());
            }
            let mut union = Vec::new();
            for clause in &self.should {
                union.extend(clause.doc_ids(reader)?);
            }
            union.sort_unstable();
            union.dedup();
            matched = Some(union);
        }

        let mut docs = matched.unwrap_or_default();
        for clause in &self.must_not {
            let excluded = clause.doc_ids(reader)?;
            docs.retain(|doc| excluded.binary_search(doc).is_err());
        }
        Ok(docs)
    }

    fn key(&self) -> String {
        let join = |clauses: &[Box<dyn Query>]| {
            clauses
                .iter()
                .map(|q| q.key())
                .collect::<Vec<_>>()
                .join(",")
        };
        format!(
            "bool(+[{}] [{}] -[{}])",
            join(&self.must),
            join(&self.should),
            join(&self.must_not)
        )
    }

    fn clone_box(&self) -> Box<dyn Query> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::index::segment_reader::SegmentReader;

    fn reader() -> SegmentReader {
        let docs = vec![
            Document::builder()
                .add_text("body", "red apple")
                .add_numeric("price", 5)
                .build(),
            Document::builder()
                .add_text("body", "green apple")
                .add_numeric("price", 12)
                .build(),
            Document::builder().add_text("body", "red pepper").build(),
        ];
        SegmentReader::from_documents("_0", &docs).unwrap()
    }

    #[test]
    fn test_term_query() {
        let reader = reader();
        let query = TermQuery::new(Term::new("body", "apple"));
        assert_eq!(query.doc_ids(&reader).unwrap(), vec![0, 1]);
        assert_eq!(query.key(), "term(body:apple)");

        let missing = TermQuery::new(Term::new("body", "kiwi"));
        assert!(missing.doc_ids(&reader).unwrap().is_empty());
    }

    #[test]
    fn test_numeric_range_query() {
        let reader = reader();
        let query = NumericRangeQuery::new("price", Some(10), None);
        assert_eq!(query.doc_ids(&reader).unwrap(), vec![1]);
        assert_eq!(query.key(), "range(price:[10 TO *])");

        let all = NumericRangeQuery::new("price", None, None);
        assert_eq!(all.doc_ids(&reader).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_boolean_query() {
        let reader = reader();
        let query = BooleanQuery::new()
            .must(Box::new(TermQuery::new(Term::new("body", "red"))))
            .must_not(Box::new(TermQuery::new(Term::new("body", "pepper"))));
        assert_eq!(query.doc_ids(&reader).unwrap(), vec![0]);

        let query = BooleanQuery::new()
            .should(Box::new(TermQuery::new(Term::new("body", "green"))))
            .should(Box::new(TermQuery::new(Term::new("body", "pepper"))));
        assert_eq!(query.doc_ids(&reader).unwrap(), vec![1, 2]);

        assert!(BooleanQuery::new().doc_ids(&reader).unwrap().is_empty());
    }

    #[test]
    fn test_match_all() {
        let reader = reader();
        assert_eq!(MatchAllDocsQuery.doc_ids(&reader).unwrap(), vec![0, 1, 2]);
    }
}
