//! Full-text index backed by an in-memory tantivy index.
//!
//! Documents are keyed by oid in an `i64` field; the extracted value is
//! flattened with [`weighted_text`] and analysed with the `en_stem` chain.
//! Writes go to a lazily created writer and are committed the first time a
//! query needs to see them.

use std::{
    any::Any,
    fmt,
    sync::{
        Mutex,
        PoisonError,
    },
};

use tantivy::{
    Index,
    IndexReader,
    IndexWriter,
    TantivyDocument,
    Term,
    collector::{
        DocSetCollector,
        TopDocs,
    },
    doc,
    query::{
        Query,
        QueryParser,
    },
    schema::{
        FAST,
        Field,
        INDEXED,
        IndexRecordOption,
        STORED,
        Schema,
        TextFieldIndexing,
        TextOptions,
        Value as _,
    },
    tokenizer::{
        Language,
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
    },
};
use tracing::debug;

use crate::{
    discriminators::{
        Discriminator,
        weighted_text,
    },
    doc_id::{
        DocId,
        DocSet,
    },
    error::Result,
    index::{
        ActionMode,
        CatalogIndex,
        Fragment,
        IndexKind,
        IndexMeta,
        unsupported,
    },
    resource::Resource,
    value::Value,
};

const TOKENIZER: &str = "en_stem";

/// Smallest budget tantivy accepts for a single indexing thread.
const WRITER_BUDGET: usize = 15_000_000;

#[derive(Clone, Copy)]
struct TextFields {
    oid: Field,
    body: Field,
}

fn build_schema() -> (Schema, TextFields) {
    let mut builder = Schema::builder();
    let oid = builder.add_i64_field("oid", INDEXED | STORED | FAST);
    let body_opts = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer(TOKENIZER)
            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
    );
    let body = builder.add_text_field("body", body_opts);
    (builder.build(), TextFields { oid, body })
}

fn register_tokenizers(index: &Index) {
    let en_stem = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(Language::English))
        .build();
    index.tokenizers().register(TOKENIZER, en_stem);
}

#[derive(Default)]
struct Pending {
    writer: Option<IndexWriter>,
    dirty: bool,
}

pub struct TextIndex {
    meta: IndexMeta,
    discriminator: Discriminator,
    index: Index,
    reader: IndexReader,
    fields: TextFields,
    pending: Mutex<Pending>,
    docids: DocSet,
    not_indexed: DocSet,
}

impl TextIndex {
    pub fn new(discriminator: Discriminator, meta: IndexMeta) -> Result<Self> {
        let (schema, fields) = build_schema();
        let index = Index::create_in_ram(schema);
        register_tokenizers(&index);
        let reader = index.reader()?;
        Ok(Self {
            meta,
            discriminator,
            index,
            reader,
            fields,
            pending: Mutex::new(Pending::default()),
            docids: DocSet::new(),
            not_indexed: DocSet::new(),
        })
    }

    fn pending_mut(&mut self) -> &mut Pending {
        self.pending
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn writer(&mut self) -> Result<&mut IndexWriter> {
        let index = self.index.clone();
        let pending = self.pending_mut();
        let writer = match pending.writer.take() {
            Some(writer) => writer,
            None => index.writer_with_num_threads(1, WRITER_BUDGET)?,
        };
        pending.dirty = true;
        Ok(pending.writer.insert(writer))
    }

    fn delete(&mut self, docid: DocId) -> Result<()> {
        let term = Term::from_field_i64(self.fields.oid, docid);
        self.writer()?.delete_term(term);
        Ok(())
    }

    /// Commit buffered writes so the reader sees them.
    pub fn flush(&self) -> Result<()> {
        let mut pending =
            self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if !pending.dirty {
            return Ok(());
        }
        if let Some(writer) = pending.writer.as_mut() {
            writer.commit()?;
        }
        pending.dirty = false;
        self.reader.reload()?;
        Ok(())
    }

    fn parse(&self, text: &str) -> Box<dyn Query> {
        let parser =
            QueryParser::for_index(&self.index, vec![self.fields.body]);
        let (query, errors) = parser.parse_query_lenient(text);
        if !errors.is_empty() {
            debug!(?errors, text, "lenient text query parse");
        }
        query
    }

    fn oid_of(&self, doc: &TantivyDocument) -> Option<DocId> {
        doc.get_first(self.fields.oid).and_then(|v| v.as_i64())
    }

    fn matching(&self, text: &str) -> Result<DocSet> {
        self.flush()?;
        let searcher = self.reader.searcher();
        let query = self.parse(text);
        let mut out = DocSet::new();
        for address in searcher.search(&query, &DocSetCollector)? {
            let doc: TantivyDocument = searcher.doc(address)?;
            out.extend(
                self.oid_of(&doc).filter(|oid| self.docids.contains(oid)),
            );
        }
        Ok(out)
    }

    /// BM25-ranked matches, best first.
    pub fn search_scored(
        &self,
        text: &str,
        limit: usize,
    ) -> Result<Vec<(DocId, f32)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.flush()?;
        let searcher = self.reader.searcher();
        let query = self.parse(text);
        let top = searcher.search(&query, &TopDocs::with_limit(limit))?;
        let mut results = Vec::with_capacity(top.len());
        for (score, address) in top {
            let doc: TantivyDocument = searcher.doc(address)?;
            if let Some(oid) = self.oid_of(&doc)
                && self.docids.contains(&oid)
            {
                results.push((oid, score));
            }
        }
        Ok(results)
    }
}

impl fmt::Debug for TextIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextIndex")
            .field("documents", &self.docids.len())
            .field("not_indexed", &self.not_indexed.len())
            .finish_non_exhaustive()
    }
}

impl CatalogIndex for TextIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Text
    }

    fn action_mode(&self) -> ActionMode {
        self.meta.action_mode
    }

    fn fingerprint(&self) -> u64 {
        self.meta.fingerprint
    }

    fn index_doc(
        &mut self,
        docid: DocId,
        resource: &dyn Resource,
    ) -> Result<()> {
        let text = self
            .discriminator
            .extract(resource)
            .as_ref()
            .and_then(weighted_text);
        self.delete(docid)?;
        let Some(text) = text else {
            self.docids.remove(&docid);
            self.not_indexed.insert(docid);
            return Ok(());
        };
        let fields = self.fields;
        self.writer()?.add_document(doc!(
            fields.oid => docid,
            fields.body => text,
        ))?;
        self.not_indexed.remove(&docid);
        self.docids.insert(docid);
        Ok(())
    }

    fn unindex_doc(&mut self, docid: DocId) -> Result<()> {
        if self.docids.remove(&docid) {
            self.delete(docid)?;
        }
        self.not_indexed.remove(&docid);
        Ok(())
    }

    fn reindex_doc(
        &mut self,
        docid: DocId,
        resource: &dyn Resource,
    ) -> Result<()> {
        self.index_doc(docid, resource)
    }

    fn reset(&mut self) -> Result<()> {
        // Buffered adds survive `delete_all_documents`; commit them first.
        self.flush()?;
        self.writer()?.delete_all_documents()?;
        self.docids.clear();
        self.not_indexed.clear();
        self.flush()
    }

    fn docids(&self) -> Option<DocSet> {
        Some(self.docids.clone())
    }

    fn not_indexed(&self) -> DocSet {
        self.not_indexed.clone()
    }

    fn apply(&self, fragment: &Fragment) -> Result<DocSet> {
        match fragment {
            Fragment::Text(text) | Fragment::Eq(Value::Text(text)) => {
                self.matching(text)
            }
            other => Err(unsupported(IndexKind::Text, other)),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
