//! Graphviz dump of the explored state graph.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use snafu::Snafu;

/// Errors writing the dot file.
#[derive(Debug, Snafu)]
pub enum DotError {
    #[snafu(display("I/O error writing dot output"), context(false))]
    Io { source: std::io::Error },
}

/// Writes `digraph graphname{ ... }`, one edge per explored transition.
///
/// A disabled output accepts every call and writes nothing, so checkers
/// never have to test whether dumping was requested.
pub struct DotOutput {
    out: Option<Box<dyn Write>>,
}

impl DotOutput {
    pub fn disabled() -> Self {
        Self { out: None }
    }

    pub fn create(path: &Path) -> Result<Self, DotError> {
        let file = File::create(path)?;
        Self::to_writer(Box::new(BufWriter::new(file)))
    }

    pub fn to_writer(mut out: Box<dyn Write>) -> Result<Self, DotError> {
        writeln!(out, "digraph graphname{{")?;
        Ok(Self { out: Some(out) })
    }

    pub fn open(path: Option<&Path>) -> Result<Self, DotError> {
        match path {
            Some(path) => Self::create(path),
            None => Ok(Self::disabled()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.out.is_some()
    }

    /// `"from" -> "to" [attributes];`
    pub fn edge(&mut self, from: u64, to: u64, attributes: &str) -> Result<(), DotError> {
        if let Some(out) = self.out.as_mut() {
            writeln!(out, "\"{from}\" -> \"{to}\" [{attributes}];")?;
        }
        Ok(())
    }

    /// `"state" [attributes];`
    pub fn node(&mut self, state: u64, attributes: &str) -> Result<(), DotError> {
        if let Some(out) = self.out.as_mut() {
            writeln!(out, "\"{state}\" [{attributes}];")?;
        }
        Ok(())
    }

    /// Close the graph, marking `last` in red when exploration stopped on
    /// a violation.
    pub fn close(&mut self, last: Option<u64>) -> Result<(), DotError> {
        if let Some(mut out) = self.out.take() {
            if let Some(last) = last {
                writeln!(out, "\"{last}\" [shape=box, color=red];")?;
            }
            writeln!(out, "}}")?;
            out.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn writes_a_graph() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.dot");
        let mut dot = DotOutput::open(Some(&path)).unwrap();
        assert!(dot.is_enabled());
        dot.edge(1, 2, "label = \"[(1)h] iSend\", color = blue, fontcolor = blue").unwrap();
        dot.node(2, "shape=doublecircle").unwrap();
        dot.close(Some(2)).unwrap();
        // Further calls after close are no-ops.
        dot.edge(2, 3, "").unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "digraph graphname{\n\
             \"1\" -> \"2\" [label = \"[(1)h] iSend\", color = blue, fontcolor = blue];\n\
             \"2\" [shape=doublecircle];\n\
             \"2\" [shape=box, color=red];\n\
             }\n"
        );
    }

    #[test]
    fn disabled_output_ignores_everything() {
        let mut dot = DotOutput::disabled();
        assert!(!dot.is_enabled());
        dot.edge(1, 2, "x").unwrap();
        dot.close(None).unwrap();
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("graph.dot");
        assert!(matches!(DotOutput::open(Some(&path)), Err(DotError::Io { .. })));
    }
}
