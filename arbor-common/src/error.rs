// Copyright 2026 foyer Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    backtrace::Backtrace,
    fmt::{Debug, Display},
    sync::Arc,
};

/// ErrorKind is all kinds of Error of arbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Config error.
    Config,
    /// A required field is missing from the cache.
    MissingField,
    /// A reference points to a node that is absent from all readable layers.
    DanglingReference,
    /// A user supplied field policy failed.
    Policy,
    /// Diffing a node failed.
    Diff,
    /// The given data does not match the expected shape.
    InvalidData,
    /// The internal indexes disagree with each other.
    Consistency,
    /// Transaction misuse or failure.
    Transaction,
    /// External error.
    External,
}

impl ErrorKind {
    /// Convert self into static str.
    pub fn into_static(self) -> &'static str {
        self.into()
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.into_static())
    }
}

impl From<ErrorKind> for &'static str {
    fn from(v: ErrorKind) -> &'static str {
        match v {
            ErrorKind::Config => "Config error",
            ErrorKind::MissingField => "Missing field",
            ErrorKind::DanglingReference => "Dangling reference",
            ErrorKind::Policy => "Policy error",
            ErrorKind::Diff => "Diff error",
            ErrorKind::InvalidData => "Invalid data",
            ErrorKind::Consistency => "Consistency error",
            ErrorKind::Transaction => "Transaction error",
            ErrorKind::External => "External error",
        }
    }
}

/// Error is the error struct returned by all arbor functions.
///
/// ## Display
///
/// - Via `Display`, like `err.to_string()`, the error is printed in a single line:
///
/// ```shell
/// Missing field, context: { operation: UserQuery, path: user.name } => can't find field 'name' on User:1
/// ```
///
/// - Via `Debug`, like `format!("{err:?}")`, the error is printed in multiple lines with context, source and
///   backtrace (if captured).
///
/// - Via `{:#?}`, the error is printed as a conventional struct.
pub struct Error {
    kind: ErrorKind,
    message: String,

    context: Vec<(&'static str, String)>,

    source: Option<Arc<anyhow::Error>>,
    backtrace: Option<Arc<Backtrace>>,
}

impl Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // If alternate has been specified, we will print like Debug.
        if f.alternate() {
            let mut de = f.debug_struct("Error");
            de.field("kind", &self.kind);
            de.field("message", &self.message);
            de.field("context", &self.context);
            de.field("source", &self.source);
            de.field("backtrace", &self.backtrace);
            return de.finish();
        }

        write!(f, "{}", self.kind)?;
        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }
        writeln!(f)?;

        if !self.context.is_empty() {
            writeln!(f)?;
            writeln!(f, "Context:")?;
            for (k, v) in self.context.iter() {
                writeln!(f, "  {}: {}", k, v)?;
            }
        }

        if let Some(source) = &self.source {
            writeln!(f)?;
            writeln!(f, "Source:")?;
            writeln!(f, "  {source:#}")?;
        }

        if let Some(backtrace) = &self.backtrace {
            writeln!(f)?;
            writeln!(f, "Backtrace:")?;
            writeln!(f, "{backtrace}")?;
        }

        Ok(())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;

        if !self.context.is_empty() {
            write!(f, ", context: {{ ")?;
            let mut iter = self.context.iter().peekable();
            while let Some((k, v)) = iter.next() {
                write!(f, "{}: {}", k, v)?;
                if iter.peek().is_some() {
                    write!(f, ", ")?;
                }
            }
            write!(f, " }}")?;
        }

        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }

        if let Some(source) = &self.source {
            write!(f, ", source: {source}")?;
        }

        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|v| v.as_ref().as_ref())
    }
}

/// Cloning an [`Error`] with large message and context can be expensive.
///
/// Deferred errors (e.g. the first error raised while re-diffing watches) are cloned once per transaction at most.
impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            context: self.context.clone(),
            source: self.source.clone(),
            backtrace: self.backtrace.clone(),
        }
    }
}

impl Error {
    /// Create a new error.
    ///
    /// If the error needs to carry a source error, please use `with_source` method.
    ///
    /// For example:
    ///
    /// ```rust
    /// # use arbor_common::error::{Error, ErrorKind};
    /// let parse_error = "x".parse::<u32>().unwrap_err();
    /// Error::new(ErrorKind::InvalidData, "invalid variables").with_source(parse_error);
    /// ```
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Vec::new(),
            source: None,
            backtrace: Some(Arc::new(Backtrace::capture())),
        }
    }

    /// Add more context in error.
    pub fn with_context(mut self, key: &'static str, value: impl ToString) -> Self {
        self.context.push((key, value.to_string()));
        self
    }

    /// Set source for error.
    ///
    /// # Notes
    ///
    /// If the source has been set, we will raise a panic here.
    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        debug_assert!(self.source.is_none(), "the source error has been set");
        self.source = Some(Arc::new(source.into()));
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the error context.
    pub fn context(&self) -> &Vec<(&'static str, String)> {
        &self.context
    }

    /// Get the value of the first context entry with the given key.
    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str())
    }

    /// Get the error backtrace.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_deref()
    }

    /// Get the error source.
    pub fn source(&self) -> Option<&anyhow::Error> {
        self.source.as_deref()
    }

    /// Downcast the reference of the source error to a specific error type reference.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source.as_deref().and_then(|e| e.downcast_ref::<E>())
    }
}

/// Result type for arbor.
pub type Result<T> = std::result::Result<T, Error>;

/// Helper methods for Error.
impl Error {
    /// Helper for creating a [`ErrorKind::MissingField`] error.
    pub fn missing_field(path: impl ToString, message: impl Into<String>) -> Self {
        Error::new(ErrorKind::MissingField, message).with_context("path", path)
    }

    /// Helper for creating a [`ErrorKind::DanglingReference`] error.
    pub fn dangling_reference(node: impl ToString) -> Self {
        let node = node.to_string();
        Error::new(ErrorKind::DanglingReference, format!("dangling reference to missing node {node}"))
            .with_context("node", node)
    }

    /// Helper for creating a [`ErrorKind::Policy`] error wrapping a failure of a user supplied policy.
    pub fn policy(type_name: impl ToString, field_name: impl ToString, source: impl Into<anyhow::Error>) -> Self {
        Error::new(ErrorKind::Policy, "field policy failed")
            .with_context("type", type_name)
            .with_context("field", field_name)
            .with_source(source)
    }

    /// Helper for creating a [`ErrorKind::Consistency`] error.
    pub fn consistency(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Consistency, message)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<Error>();
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[test]
    fn test_error_display() {
        let err = Error::missing_field("user.name", "can't find field 'name' on User:1")
            .with_context("operation", "UserQuery");

        assert_eq!(
            "Missing field, context: { path: user.name, operation: UserQuery } => can't find field 'name' on User:1",
            err.to_string()
        );
        assert_eq!(err.context_value("operation"), Some("UserQuery"));
        assert_eq!(err.context_value("unknown"), None);
    }

    #[test]
    fn test_error_downcast() {
        let inner = TestError("merge failed".to_string());
        let err = Error::policy("User", "friends", inner.clone());

        assert_eq!(err.kind(), ErrorKind::Policy);
        let downcasted = err.downcast_ref::<TestError>().unwrap();
        assert_eq!(downcasted, &inner);
    }

    #[test]
    fn test_dangling_reference() {
        let err = Error::dangling_reference("User:2");
        assert_eq!(err.kind(), ErrorKind::DanglingReference);
        assert_eq!(err.context_value("node"), Some("User:2"));
        assert_eq!(err.message(), "dangling reference to missing node User:2");
    }

    #[test]
    fn test_error_format() {
        let e = Error::new(ErrorKind::External, "external error")
            .with_context("k1", "v2")
            .with_context("k2", "v2")
            .with_source(TestError("test error".into()));

        println!("========== BEGIN DISPLAY FORMAT ==========");
        println!("{e}");
        println!("========== END DISPLAY FORMAT ==========");

        println!();

        println!("========== BEGIN DEBUG FORMAT ==========");
        println!("{e:?}");
        println!("========== END DEBUG FORMAT ==========");

        println!();

        println!("========== BEGIN DEBUG FORMAT (PRETTY) ==========");
        println!("{e:#?}");
        println!("========== END DEBUG FORMAT (PRETTY) ==========");
    }
}
