//! Processing tool registry and built-in corpus analysis tools.
//!
//! Tools implement the `ProcessingTool` trait from the SDK crate. The
//! registry owns the instances, enforces a per-call timeout, and routes each
//! invocation through the retry controller with a tool-specific classifier:
//! timeouts are retried, everything else fails the cell immediately.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use driftlab_sdk::{Document, ProcessingTool, ToolError};

use crate::retry::{call_with_retry, ErrorDisposition, RetryError, RetryPolicy};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Retry disposition for a tool failure. Only timeouts are transient; bad
/// input and execution failures are properties of the document.
pub fn classify_tool_error(err: &ToolError) -> ErrorDisposition {
    match err {
        ToolError::Timeout(_) => ErrorDisposition::Retriable,
        ToolError::InvalidInput(_) | ToolError::Execution(_) => ErrorDisposition::Fatal,
    }
}

/// Name-indexed set of processing tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ProcessingTool>>,
    call_timeout: Duration,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn register(&mut self, tool: Arc<dyn ProcessingTool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Registry preloaded with the built-in corpus analysis tools.
    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EntityExtractionTool));
        registry.register(Arc::new(TemporalExtractionTool));
        registry.register(Arc::new(TermFrequencyTool));
        registry.register(Arc::new(CollocationTool));
        registry
    }

    /// Registered tool names, sorted for stable prompts and listings.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// First name in the iterator that is not registered, if any.
    pub fn first_unknown<'a>(
        &self,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Option<String> {
        names
            .into_iter()
            .find(|name| !self.tools.contains_key(*name))
            .map(|name| name.to_string())
    }

    /// (name, description) pairs for the named tools, skipping unknowns.
    pub fn descriptions(&self, names: &[String]) -> Vec<(String, String)> {
        names
            .iter()
            .filter_map(|name| {
                self.tools
                    .get(name)
                    .map(|tool| (name.clone(), tool.description().to_string()))
            })
            .collect()
    }

    /// Run one tool on one document, with the per-call timeout and retry on
    /// transient failures.
    pub async fn execute(
        &self,
        name: &str,
        document: &Document,
        retry: &RetryPolicy,
    ) -> Result<serde_json::Value, RetryError<ToolError>> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| {
                RetryError::Fatal(ToolError::InvalidInput(format!("unknown tool '{name}'")))
            })?
            .clone();

        let timeout = self.call_timeout;
        call_with_retry(retry, classify_tool_error, || {
            let tool = tool.clone();
            async move {
                match tokio::time::timeout(timeout, tool.run(document)).await {
                    Ok(result) => result,
                    Err(_) => Err(ToolError::Timeout(timeout)),
                }
            }
        })
        .await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_builtin_tools()
    }
}

// ----------------------------------------------------------------------
// Built-in tools
// ----------------------------------------------------------------------

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "was", "are", "were", "be", "been", "being", "it", "its", "this", "that",
    "these", "those", "he", "she", "they", "we", "you", "i", "his", "her", "their", "our", "your",
    "my", "not", "no", "so", "if", "then", "than", "when", "which", "who", "whom", "what", "all",
    "any", "each", "both", "more", "most", "other", "some", "such", "only", "own", "same", "very",
    "can", "will", "just", "do", "did", "does", "had", "has", "have", "there", "here", "upon",
];

fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(&word.to_lowercase().as_str())
}

fn tokenize(text: &str) -> Vec<&str> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|t| !t.is_empty())
        .collect()
}

/// Named entity extraction by capitalization heuristic: a capitalized word
/// that is not sentence-initial and not a stopword is treated as a proper
/// noun. Crude, but language-model-free and deterministic.
pub struct EntityExtractionTool;

#[async_trait]
impl ProcessingTool for EntityExtractionTool {
    fn name(&self) -> &str {
        "extract_entities"
    }

    fn description(&self) -> &str {
        "Extract proper nouns (people, places, organizations) using a capitalization heuristic"
    }

    async fn run(&self, document: &Document) -> Result<serde_json::Value, ToolError> {
        let text = &document.content_preview;
        if text.trim().is_empty() {
            return Err(ToolError::InvalidInput("document has no content".to_string()));
        }

        let mut entities: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for sentence in text.split(['.', '!', '?']) {
            let tokens = tokenize(sentence);
            // Skip the sentence-initial token; its capital carries no signal.
            for token in tokens.iter().skip(1) {
                let starts_upper = token.chars().next().is_some_and(|c| c.is_uppercase());
                if starts_upper && !is_stopword(token) && seen.insert(token.to_string()) {
                    entities.push(token.to_string());
                }
            }
        }

        Ok(serde_json::json!({ "entities": entities }))
    }
}

/// Temporal expression extraction: four-digit years, decades ("1890s") and
/// ordinal centuries.
pub struct TemporalExtractionTool;

#[async_trait]
impl ProcessingTool for TemporalExtractionTool {
    fn name(&self) -> &str {
        "extract_temporal"
    }

    fn description(&self) -> &str {
        "Extract temporal expressions: years, decades, and centuries"
    }

    async fn run(&self, document: &Document) -> Result<serde_json::Value, ToolError> {
        let text = &document.content_preview;
        if text.trim().is_empty() {
            return Err(ToolError::InvalidInput("document has no content".to_string()));
        }

        let mut expressions: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        let tokens = tokenize(text);
        for (i, token) in tokens.iter().enumerate() {
            if let Some(expr) = year_or_decade(token) {
                if seen.insert(expr.clone()) {
                    expressions.push(expr);
                }
                continue;
            }
            // "19th century", "twentieth century"
            if token.eq_ignore_ascii_case("century") && i > 0 {
                let expr = format!("{} century", tokens[i - 1]);
                if seen.insert(expr.to_lowercase()) {
                    expressions.push(expr);
                }
            }
        }

        Ok(serde_json::json!({ "temporal_expressions": expressions }))
    }
}

/// A plausible year 1000..=2099 ("1850") or decade ("1890s").
fn year_or_decade(token: &str) -> Option<String> {
    let (digits, is_decade) = match token.strip_suffix('s') {
        Some(rest) => (rest, true),
        None => (token, false),
    };
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let year: u32 = digits.parse().ok()?;
    if !(1000..=2099).contains(&year) {
        return None;
    }
    if is_decade && year % 10 != 0 {
        return None;
    }
    Some(token.to_string())
}

/// Term frequency: top content words by count.
pub struct TermFrequencyTool;

#[async_trait]
impl ProcessingTool for TermFrequencyTool {
    fn name(&self) -> &str {
        "term_frequency"
    }

    fn description(&self) -> &str {
        "Count content-word frequencies, reporting the top terms"
    }

    async fn run(&self, document: &Document) -> Result<serde_json::Value, ToolError> {
        let text = &document.content_preview;
        if text.trim().is_empty() {
            return Err(ToolError::InvalidInput("document has no content".to_string()));
        }

        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for token in tokenize(text) {
            if token.len() < 3 || is_stopword(token) {
                continue;
            }
            *counts.entry(token.to_lowercase()).or_insert(0) += 1;
        }

        let mut ranked: Vec<(String, u64)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(20);

        let terms: Vec<serde_json::Value> = ranked
            .into_iter()
            .map(|(term, count)| serde_json::json!({ "term": term, "count": count }))
            .collect();
        Ok(serde_json::json!({ "terms": terms }))
    }
}

/// Collocations: adjacent content-word pairs, ranked by count. The company a
/// word keeps is the primary signal for sense change.
pub struct CollocationTool;

#[async_trait]
impl ProcessingTool for CollocationTool {
    fn name(&self) -> &str {
        "collocations"
    }

    fn description(&self) -> &str {
        "Rank adjacent content-word pairs to surface a term's collocates"
    }

    async fn run(&self, document: &Document) -> Result<serde_json::Value, ToolError> {
        let text = &document.content_preview;
        if text.trim().is_empty() {
            return Err(ToolError::InvalidInput("document has no content".to_string()));
        }

        let mut counts: BTreeMap<(String, String), u64> = BTreeMap::new();
        for sentence in text.split(['.', '!', '?']) {
            let content: Vec<String> = tokenize(sentence)
                .into_iter()
                .filter(|t| t.len() >= 3 && !is_stopword(t))
                .map(|t| t.to_lowercase())
                .collect();
            for pair in content.windows(2) {
                counts
                    .entry((pair[0].clone(), pair[1].clone()))
                    .and_modify(|c| *c += 1)
                    .or_insert(1);
            }
        }

        let mut ranked: Vec<((String, String), u64)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(10);

        let pairs: Vec<serde_json::Value> = ranked
            .into_iter()
            .map(|((left, right), count)| {
                serde_json::json!({ "pair": [left, right], "count": count })
            })
            .collect();
        Ok(serde_json::json!({ "collocations": pairs }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(content: &str) -> Document {
        Document {
            id: "7".to_string(),
            title: "Sermons 1850".to_string(),
            content_preview: content.to_string(),
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn entity_extraction_skips_sentence_initial_capitals() {
        let result = EntityExtractionTool
            .run(&doc(
                "The minister spoke in Boston. Reverend Whitfield did broadcast seed there.",
            ))
            .await
            .unwrap();

        let entities: Vec<String> =
            serde_json::from_value(result["entities"].clone()).unwrap();
        assert!(entities.contains(&"Boston".to_string()));
        assert!(entities.contains(&"Whitfield".to_string()));
        // Sentence-initial words are not entities by this heuristic.
        assert!(!entities.contains(&"The".to_string()));
        assert!(!entities.contains(&"Reverend".to_string()));
    }

    #[tokio::test]
    async fn temporal_extraction_finds_years_decades_and_centuries() {
        let result = TemporalExtractionTool
            .run(&doc(
                "Written in 1851, reprinted through the 1890s, studied in the 19th century.",
            ))
            .await
            .unwrap();

        let exprs: Vec<String> =
            serde_json::from_value(result["temporal_expressions"].clone()).unwrap();
        assert!(exprs.contains(&"1851".to_string()));
        assert!(exprs.contains(&"1890s".to_string()));
        assert!(exprs.contains(&"19th century".to_string()));
    }

    #[tokio::test]
    async fn term_frequency_ignores_stopwords_and_ranks_by_count() {
        let result = TermFrequencyTool
            .run(&doc("broadcast the seed, broadcast the word, gather the seed"))
            .await
            .unwrap();

        let terms = result["terms"].as_array().unwrap();
        assert_eq!(terms[0]["term"], "broadcast");
        assert_eq!(terms[0]["count"], 2);
        assert!(terms.iter().all(|t| t["term"] != "the"));
    }

    #[tokio::test]
    async fn collocations_pair_adjacent_content_words() {
        let result = CollocationTool
            .run(&doc("broadcast seed widely. broadcast seed again."))
            .await
            .unwrap();

        let pairs = result["collocations"].as_array().unwrap();
        assert_eq!(pairs[0]["pair"][0], "broadcast");
        assert_eq!(pairs[0]["pair"][1], "seed");
        assert_eq!(pairs[0]["count"], 2);
    }

    #[tokio::test]
    async fn empty_document_is_invalid_input() {
        let err = TermFrequencyTool.run(&doc("   ")).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn registry_executes_by_name_and_rejects_unknowns() {
        let registry = ToolRegistry::with_builtin_tools();
        assert_eq!(
            registry.names(),
            vec![
                "collocations",
                "extract_entities",
                "extract_temporal",
                "term_frequency"
            ]
        );
        assert_eq!(
            registry.first_unknown(["term_frequency", "sentiment"].into_iter()),
            Some("sentiment".to_string())
        );

        let policy = RetryPolicy {
            max_retries: 0,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let value = registry
            .execute("term_frequency", &doc("broadcast seed"), &policy)
            .await
            .unwrap();
        assert!(value["terms"].is_array());

        let err = registry
            .execute("sentiment", &doc("broadcast seed"), &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, RetryError::Fatal(ToolError::InvalidInput(_))));
    }

    struct SlowTool;

    #[async_trait]
    impl ProcessingTool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "never finishes"
        }
        async fn run(&self, _document: &Document) -> Result<serde_json::Value, ToolError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(serde_json::Value::Null)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_retried_until_exhaustion() {
        let mut registry =
            ToolRegistry::new().with_call_timeout(Duration::from_millis(10));
        registry.register(Arc::new(SlowTool));

        let policy = RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        };
        let err = registry
            .execute("slow", &doc("anything"), &policy)
            .await
            .unwrap_err();
        match err {
            RetryError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(last, ToolError::Timeout(_)));
            }
            other => panic!("expected exhaustion, got {other}"),
        }
    }
}
