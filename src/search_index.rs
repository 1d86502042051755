use std::{collections::HashSet, path::Path};

use tantivy::{
    Index,
    IndexReader,
    IndexWriter,
    TantivyDocument,
    Term,
    collector::TopDocs,
    doc,
    query::{
        BooleanQuery,
        FuzzyTermQuery,
        Occur,
        Query,
        QueryParser,
        TermSetQuery,
    },
    schema::*,
    tokenizer::{
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
        TokenStream,
    },
};

use crate::{
    error::Result,
    form::{Form, FormId},
};

/// Field names used in the schema.
pub mod fields {
    pub const FORM_ID: &str = "form_id";
    pub const TITLE: &str = "title";
    pub const KEYWORDS: &str = "keywords";
    pub const DESCRIPTION: &str = "description";
}

const TOKENIZER: &str = "en_stem";

/// Shortest query token that also gets prefix and fuzzy expansions.
const MIN_EXPANSION_LEN: usize = 3;

/// Full-text (BM25) index over the searchable fields of every live form.
pub struct SearchIndex {
    index: Index,
    reader: IndexReader,
    fields: SchemaFields,
}

/// Resolved field handles for the schema.
#[derive(Clone, Copy)]
pub struct SchemaFields {
    pub form_id: Field,
    pub title: Field,
    pub keywords: Field,
    pub description: Field,
}

/// A lexical candidate, best first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LexicalHit {
    pub form_id: FormId,
    pub score: f32,
}

fn build_schema() -> (Schema, SchemaFields) {
    let mut builder = Schema::builder();

    let form_id =
        builder.add_u64_field(fields::FORM_ID, INDEXED | STORED | FAST);

    let text = |stored: bool| {
        let opts = TextOptions::default().set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(TOKENIZER)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        );
        if stored { opts.set_stored() } else { opts }
    };
    let title = builder.add_text_field(fields::TITLE, text(true));
    let keywords = builder.add_text_field(fields::KEYWORDS, text(false));
    let description = builder.add_text_field(fields::DESCRIPTION, text(false));

    let schema = builder.build();
    let fields = SchemaFields {
        form_id,
        title,
        keywords,
        description,
    };

    (schema, fields)
}

fn analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(tantivy::tokenizer::Language::English))
        .build()
}

fn register_tokenizers(index: &Index) {
    index.tokenizers().register(TOKENIZER, analyzer());
}

/// Normalize `text` into the same tokens the index stores.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut analyzer = analyzer();
    let mut stream = analyzer.token_stream(text);
    let mut tokens = Vec::new();
    stream.process(&mut |token| tokens.push(token.text.clone()));
    tokens
}

impl SearchIndex {
    /// Open or create a search index at the given directory.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let (schema, fields) = build_schema();

        let mmap_dir = tantivy::directory::MmapDirectory::open(dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?;
        let index = if Index::exists(&mmap_dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?
        {
            Index::open(mmap_dir)?
        } else {
            Index::create(mmap_dir, schema, tantivy::IndexSettings::default())?
        };

        Self::from_index(index, fields)
    }

    /// Create an in-memory search index (for testing).
    pub fn open_in_ram() -> Result<Self> {
        let (schema, fields) = build_schema();
        Self::from_index(Index::create_in_ram(schema), fields)
    }

    fn from_index(index: Index, fields: SchemaFields) -> Result<Self> {
        register_tokenizers(&index);
        let reader = index.reader()?;
        Ok(Self {
            index,
            reader,
            fields,
        })
    }

    /// Create a writer with the given memory budget (in bytes).
    pub fn writer(&self, memory_budget: usize) -> Result<IndexWriter> {
        Ok(self.index.writer(memory_budget)?)
    }

    /// Replace the indexed copy of `form` via the given writer.
    pub fn upsert(&self, writer: &IndexWriter, form: &Form) -> Result<()> {
        let f = self.fields;
        self.delete(writer, form.id);

        writer.add_document(doc!(
            f.form_id => form.id.0,
            f.title => form.title.as_str(),
            f.keywords => form.keywords.join(" "),
            f.description => form.description.as_deref().unwrap_or(""),
        ))?;

        Ok(())
    }

    pub fn delete(&self, writer: &IndexWriter, id: FormId) {
        writer.delete_term(Term::from_field_u64(self.fields.form_id, id.0));
    }

    /// Make the latest commit visible to searches.
    pub fn reload(&self) -> Result<()> {
        Ok(self.reader.reload()?)
    }

    pub fn num_docs(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// BM25 over title (boost 2), keywords (1.5) and description, OR'd with
    /// prefix and distance-1 fuzzy expansions of every query token.
    ///
    /// With `scope`, only those forms can match, so `limit` counts hits
    /// inside the scope rather than across the whole index.
    pub fn search(
        &self,
        query_str: &str,
        scope: Option<&[FormId]>,
        limit: usize,
    ) -> Result<Vec<LexicalHit>> {
        let f = self.fields;
        if query_str.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let searcher = self.reader.searcher();

        let mut parser = QueryParser::for_index(
            &self.index,
            vec![f.title, f.keywords, f.description],
        );
        parser.set_field_boost(f.title, 2.0);
        parser.set_field_boost(f.keywords, 1.5);
        let (bm25_query, _errors) = parser.parse_query_lenient(query_str);

        let mut should: Vec<(Occur, Box<dyn Query>)> =
            vec![(Occur::Should, bm25_query)];

        for word in query_str.split_whitespace() {
            let raw = word
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if raw.chars().count() < MIN_EXPANSION_LEN {
                continue;
            }
            for field in [f.title, f.keywords] {
                let prefix = Term::from_field_text(field, &raw);
                should.push((
                    Occur::Should,
                    Box::new(FuzzyTermQuery::new_prefix(prefix, 0, true)),
                ));
            }
            for stem in tokenize(&raw) {
                for field in [f.title, f.keywords, f.description] {
                    let term = Term::from_field_text(field, &stem);
                    should.push((
                        Occur::Should,
                        Box::new(FuzzyTermQuery::new(term, 1, true)),
                    ));
                }
            }
        }

        let mut query: Box<dyn Query> = Box::new(BooleanQuery::new(should));
        if let Some(scope) = scope {
            if scope.is_empty() {
                return Ok(Vec::new());
            }
            let ids = scope
                .iter()
                .map(|id| Term::from_field_u64(f.form_id, id.0));
            let in_scope: Box<dyn Query> = Box::new(TermSetQuery::new(ids));
            let must: Vec<(Occur, Box<dyn Query>)> =
                vec![(Occur::Must, query), (Occur::Must, in_scope)];
            query = Box::new(BooleanQuery::new(must));
        }
        let top_docs =
            searcher.search(query.as_ref(), &TopDocs::with_limit(limit))?;

        let mut seen = HashSet::new();
        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher.doc(doc_address)?;
            let Some(id) = doc.get_first(f.form_id).and_then(|v| v.as_u64())
            else {
                continue;
            };
            if seen.insert(id) {
                results.push(LexicalHit {
                    form_id: FormId(id),
                    score,
                });
            }
        }

        Ok(results)
    }
}

impl std::fmt::Debug for SearchIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchIndex").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::NewForm;

    fn form(
        id: u64,
        title: &str,
        keywords: &[&str],
        description: &str,
    ) -> Form {
        let mut input = NewForm::new(title, "general");
        input.keywords = keywords.iter().map(|k| k.to_string()).collect();
        input.description = Some(description.to_string());
        input.into_form(FormId(id), "alice", id * 1000).unwrap()
    }

    fn index_with(forms: &[Form]) -> SearchIndex {
        let idx = SearchIndex::open_in_ram().unwrap();
        let mut writer = idx.writer(15_000_000).unwrap();
        for form in forms {
            idx.upsert(&writer, form).unwrap();
        }
        writer.commit().unwrap();
        idx.reload().unwrap();
        idx
    }

    fn sample() -> Vec<Form> {
        vec![
            form(
                1,
                "Oversize Vehicle Permit",
                &["trucks", "transport"],
                "Apply for a permit to move oversized loads on state roads.",
            ),
            form(
                2,
                "Business License Renewal",
                &["license"],
                "Renew an existing business license before it expires.",
            ),
            form(
                3,
                "Fishing License Application",
                &["outdoors"],
                "Recreational fishing permits and licenses for residents.",
            ),
        ]
    }

    #[test]
    fn tokenize_matches_index_analysis() {
        assert_eq!(
            tokenize("Running Vehicles, FAST!"),
            vec!["run", "vehicl", "fast"]
        );
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn exact_title_ranks_first() {
        let idx = index_with(&sample());
        let results = idx.search("Business License Renewal", None, 10).unwrap();
        assert_eq!(results[0].form_id, FormId(2));
    }

    #[test]
    fn title_boost() {
        let idx = index_with(&sample());
        let results = idx.search("permit", None, 10).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].form_id, FormId(1));
    }

    #[test]
    fn prefix_and_typo_match() {
        let idx = index_with(&sample());
        let prefix = idx.search("overs", None, 10).unwrap();
        assert_eq!(prefix[0].form_id, FormId(1));

        let typo = idx.search("vehcle", None, 10).unwrap();
        assert_eq!(typo[0].form_id, FormId(1));
    }

    #[test]
    fn keywords_are_searchable() {
        let idx = index_with(&sample());
        let results = idx.search("outdoors", None, 10).unwrap();
        assert_eq!(results[0].form_id, FormId(3));
    }

    #[test]
    fn upsert_replaces_and_delete_removes() {
        let forms = sample();
        let idx = index_with(&forms);
        let mut writer = idx.writer(15_000_000).unwrap();

        let mut renamed = forms[0].clone();
        renamed.title = "Wide Load Permit".into();
        idx.upsert(&writer, &renamed).unwrap();
        idx.delete(&writer, FormId(2));
        writer.commit().unwrap();
        idx.reload().unwrap();

        assert_eq!(idx.num_docs(), 2);
        let results = idx.search("wide load", None, 10).unwrap();
        assert_eq!(results.len(), 1);
        assert!(idx.search("renewal", None, 10).unwrap().is_empty());
    }

    #[test]
    fn scope_limits_before_truncation() {
        let mut forms: Vec<Form> =
            (1..=80).map(|id| form(id, "Permit", &[], "")).collect();
        forms.push(form(
            81,
            "Annual Roadside Vendor Stall Operating Permit",
            &[],
            "Seasonal trading at county fairs and farmers markets.",
        ));
        let idx = index_with(&forms);

        let global = idx.search("permit", None, 5).unwrap();
        assert_eq!(global.len(), 5);
        assert!(global.iter().all(|h| h.form_id != FormId(81)));

        let scope = vec![FormId(81), FormId(999)];
        let scoped = idx.search("permit", Some(scope.as_slice()), 5).unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].form_id, FormId(81));

        let nothing: &[FormId] = &[];
        assert!(idx.search("permit", Some(nothing), 5).unwrap().is_empty());
    }

    #[test]
    fn blank_query_matches_nothing() {
        let idx = index_with(&sample());
        assert!(idx.search("  ", None, 10).unwrap().is_empty());
        assert!(idx.search("xyzzyq", None, 10).unwrap().is_empty());
    }

    #[test]
    fn disk_persistence() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("tantivy");

        {
            let idx = SearchIndex::open(&dir).unwrap();
            let mut writer = idx.writer(15_000_000).unwrap();
            idx.upsert(&writer, &sample()[2]).unwrap();
            writer.commit().unwrap();
        }

        let idx = SearchIndex::open(&dir).unwrap();
        let results = idx.search("fishing", None, 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].form_id, FormId(3));
    }
}
