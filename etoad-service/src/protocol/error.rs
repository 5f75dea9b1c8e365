// Protocol load errors
// Carries kind, location, a source excerpt and an optional suggestion

use std::fmt;

/// Detailed load error with location and context
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    /// Line number (1-indexed, 0 when unknown)
    pub line: usize,
    /// Column number (1-indexed, 0 when unknown)
    pub column: usize,
    /// A few source lines around the error
    pub context: String,
    pub suggestion: Option<String>,
    pub kind: ParseErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// JSON or YAML syntax error
    Syntax,
    /// Wrong value types or shape
    InvalidSchema,
    /// Required key absent
    MissingField,
    /// Protocol without steps
    EmptyProtocol,
    /// Two steps share a name
    DuplicateStep,
    /// Update rule names a step that does not exist
    UnknownStep,
    /// Update rule names the owning step or a later one
    ForwardReference,
    /// Malformed filter or pick expression
    ExpressionError,
    /// File could not be read
    IoError,
    /// File suffix is not .json, .yaml or .yml
    UnsupportedFormat,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParseErrorKind::Syntax => "syntax",
            ParseErrorKind::InvalidSchema => "invalid schema",
            ParseErrorKind::MissingField => "missing field",
            ParseErrorKind::EmptyProtocol => "empty protocol",
            ParseErrorKind::DuplicateStep => "duplicate step",
            ParseErrorKind::UnknownStep => "unknown step",
            ParseErrorKind::ForwardReference => "forward reference",
            ParseErrorKind::ExpressionError => "expression",
            ParseErrorKind::IoError => "io",
            ParseErrorKind::UnsupportedFormat => "unsupported format",
        };
        write!(f, "{}", s)
    }
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: 0,
            column: 0,
            context: String::new(),
            suggestion: None,
            kind,
        }
    }

    pub fn at(mut self, line: usize, column: usize) -> Self {
        self.line = line;
        self.column = column;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Point at the first occurrence of `needle` in `source`, if any
    pub fn located(self, source: &str, needle: &str) -> Self {
        match locate(source, needle) {
            Some((line, column)) => self.at(line, column).with_source_context(source, 2),
            None => self,
        }
    }

    /// Render the lines around `self.line` with a marker under the column
    pub fn with_source_context(mut self, source: &str, context_lines: usize) -> Self {
        if self.line == 0 {
            return self;
        }

        let lines: Vec<&str> = source.lines().collect();
        let start = self.line.saturating_sub(context_lines + 1);
        let end = (self.line + context_lines).min(lines.len());

        let mut context = String::new();
        for (i, line) in lines.iter().enumerate().take(end).skip(start) {
            let line_num = i + 1;
            let prefix = if line_num == self.line { ">" } else { " " };
            context.push_str(&format!("{} {:4} | {}\n", prefix, line_num, line));

            if line_num == self.line && self.column > 0 {
                let indicator = " ".repeat(self.column - 1) + "^";
                context.push_str(&format!("       | {}\n", indicator));
            }
        }

        self.context = context;
        self
    }

    pub fn from_json_error(err: &serde_json::Error, source: &str) -> Self {
        let message = strip_location(&err.to_string());
        let mut error = ParseError::new(ParseErrorKind::Syntax, message)
            .at(err.line(), err.column())
            .with_source_context(source, 2);
        if err.is_eof() {
            error = error.with_suggestion("the document ends early; check for a missing '}' or ']'");
        }
        error
    }

    pub fn from_yaml_error(err: &serde_yaml::Error, source: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((0, 0));

        let mut error = ParseError::new(ParseErrorKind::Syntax, strip_location(&err.to_string()))
            .at(line, column)
            .with_source_context(source, 2);

        let error_line = source.lines().nth(line.saturating_sub(1)).unwrap_or("");
        if error_line.starts_with('\t') {
            error = error.with_suggestion("YAML does not allow tabs for indentation");
        }
        error
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)?;
        if self.line > 0 {
            write!(f, "\n  --> line {}:{}", self.line, self.column)?;
        }

        if !self.context.is_empty() {
            write!(f, "\n\n{}", self.context.trim_end())?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\n\nhelp: {}", suggestion)?;
        }

        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// Result type for protocol loading
pub type ParseResult<T> = Result<T, ParseError>;

fn locate(source: &str, needle: &str) -> Option<(usize, usize)> {
    source.lines().enumerate().find_map(|(i, line)| {
        line.find(needle)
            .map(|col| (i + 1, line[..col].chars().count() + 1))
    })
}

/// serde messages end in " at line X column Y"; the location is kept separately
fn strip_location(msg: &str) -> String {
    match msg.rfind(" at line ") {
        Some(idx) => msg[..idx].to_string(),
        None => msg.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::new(ParseErrorKind::MissingField, "missing required key 'Purge'")
            .at(3, 5)
            .with_suggestion("add \"Purge\": <seconds> to the protocol");

        let output = err.to_string();
        assert!(output.contains("missing field error"));
        assert!(output.contains("line 3:5"));
        assert!(output.contains("help:"));
    }

    #[test]
    fn test_display_without_location() {
        let err = ParseError::new(ParseErrorKind::UnsupportedFormat, "unsupported file type 'txt'");
        assert!(!err.to_string().contains("-->"));
    }

    #[test]
    fn test_located_points_at_needle() {
        let source = "{\n  \"Steps\": {\n    \"CV\": {}\n  }\n}";
        let err = ParseError::new(ParseErrorKind::DuplicateStep, "duplicate").located(source, "\"CV\"");

        assert_eq!(err.line, 3);
        assert_eq!(err.column, 5);
        assert!(err.context.contains(">    3 |"));
    }

    #[test]
    fn test_from_json_error() {
        let source = "{\n  \"Protocol Name\": \n}";
        let json_err = serde_json::from_str::<serde_json::Value>(source).unwrap_err();
        let err = ParseError::from_json_error(&json_err, source);

        assert_eq!(err.kind, ParseErrorKind::Syntax);
        assert_eq!(err.line, 3);
        assert!(!err.message.contains(" at line "));
    }
}
