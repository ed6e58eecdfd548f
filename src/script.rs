// ABOUTME: Bootstrap SQL scripts with positional %s placeholders
// ABOUTME: Replicates one scalar value into every placeholder and runs the script on the target

use anyhow::{bail, Context, Result};
use std::path::Path;
use tokio_postgres::GenericClient;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Placeholder,
}

/// SQL script text split around its `%s` placeholders.
///
/// `%%` is a literal percent sign. Any other `%` is kept as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionalScript {
    segments: Vec<Segment>,
}

impl PositionalScript {
    pub fn parse(text: &str) -> Self {
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '%' {
                current.push(c);
                continue;
            }
            match chars.peek() {
                Some('s') => {
                    chars.next();
                    if !current.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut current)));
                    }
                    segments.push(Segment::Placeholder);
                }
                Some('%') => {
                    chars.next();
                    current.push('%');
                }
                _ => current.push('%'),
            }
        }

        if !current.is_empty() {
            segments.push(Segment::Text(current));
        }

        Self { segments }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read script {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    /// Number of `%s` placeholders.
    pub fn placeholder_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Placeholder))
            .count()
    }

    /// The positional parameter list: `value` once per placeholder.
    pub fn replicate<T: Clone>(&self, value: T) -> Vec<T> {
        vec![value; self.placeholder_count()]
    }

    /// Script text with every placeholder replaced by `value` as a quoted literal.
    ///
    /// The literal is untyped, so the server resolves it from context (a date
    /// comparison sees a date) just as it would a literal typed into the script.
    pub fn render(&self, value: &str) -> String {
        let mut values = self.replicate(quote_literal(value)).into_iter();
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Placeholder => {
                    if let Some(literal) = values.next() {
                        out.push_str(&literal);
                    }
                }
            }
        }
        out
    }

    /// Run the script on `client` with `value` replicated into every placeholder.
    ///
    /// Scripts may hold several statements, so they go through the simple
    /// query protocol.
    pub async fn execute<C: GenericClient>(&self, client: &C, value: Option<&str>) -> Result<()> {
        let count = self.placeholder_count();
        let sql = match (count, value) {
            (0, _) => self.render(""),
            (_, Some(value)) => self.render(value),
            (_, None) => bail!(
                "Script has {} %s placeholder(s) but no parameter was given",
                count
            ),
        };

        tracing::info!("Running bootstrap script ({} placeholder(s))", count);
        tracing::debug!("Bootstrap script: {}", sql);

        client
            .batch_execute(&sql)
            .await
            .context("Bootstrap script failed")?;

        Ok(())
    }
}

/// Quote `value` as a standard SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
