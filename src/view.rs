//! Renderers for a built dependency graph
//!
//! Each format is a `Visitor` driven by one of the traversals; the renderers only read the
//! graph.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::str::FromStr;

use fs_err as fs;
use serde::Serialize;
use tracing::debug;

use crate::common::{path_to_string, WalkError};
use crate::context::{Function, Module};
use crate::graph::{DependencyGraph, NodeId};
use crate::traverse::{BreadthFirst, DepthFirst, NodeRef, Traversal, Visitor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Indented tree
    Ascii,
    Json,
    /// Graphviz
    Dot,
    /// `Source,Target` edge list
    Csv,
}

impl FromStr for Format {
    type Err = WalkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ascii" => Ok(Self::Ascii),
            "json" => Ok(Self::Json),
            "dot" => Ok(Self::Dot),
            "csv" => Ok(Self::Csv),
            _ => Err(WalkError::UnsupportedFormat(s.to_owned())),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ascii => "ascii",
            Self::Json => "json",
            Self::Dot => "dot",
            Self::Csv => "csv",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ViewOptions {
    pub format: Format,
    /// Also list the imported functions
    pub functions: bool,
    pub indent: usize,
    /// Undecorate MSVC C++ names
    pub demangle: bool,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            format: Format::Ascii,
            functions: false,
            indent: 2,
            demangle: false,
        }
    }
}

/// Undecorated form of an MSVC C++ symbol; other names are returned as they are
pub fn demangle_symbol(symbol: &str) -> String {
    if !symbol.starts_with('?') {
        return symbol.to_owned();
    }
    let flags =
        msvc_demangler::DemangleFlags::llvm() | msvc_demangler::DemangleFlags::NO_MS_KEYWORDS;
    msvc_demangler::demangle(symbol, flags).unwrap_or_else(|e| {
        debug!("could not demangle {}: {}", symbol, e);
        symbol.to_owned()
    })
}

fn function_name(function: &Function, demangle: bool) -> String {
    if demangle {
        demangle_symbol(function.name())
    } else {
        function.name().to_owned()
    }
}

struct AsciiView<'w, W: ?Sized> {
    out: &'w mut W,
    options: &'w ViewOptions,
}

impl<W: Write + ?Sized> Visitor<Module> for AsciiView<'_, W> {
    fn visit(&mut self, node: NodeRef<'_, Module>, depth: usize) -> Result<(), WalkError> {
        let offset = " ".repeat(depth * self.options.indent);
        let module = node.context();
        writeln!(self.out, "{}{}", offset, module)?;
        if self.options.functions {
            for import in module.imports() {
                for f in import.functions() {
                    writeln!(
                        self.out,
                        "{}- {}!{}",
                        offset,
                        import,
                        function_name(f, self.options.demangle)
                    )?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonImport {
    alias: String,
    unresolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    functions: Option<Vec<String>>,
}

#[derive(Serialize)]
struct JsonModule {
    path: Option<String>,
    imports: BTreeMap<String, JsonImport>,
}

#[derive(Default)]
struct JsonView {
    functions: bool,
    demangle: bool,
    modules: BTreeMap<String, JsonModule>,
}

impl Visitor<Module> for JsonView {
    fn visit(&mut self, node: NodeRef<'_, Module>, _depth: usize) -> Result<(), WalkError> {
        let module = node.context();
        let imports = module
            .imports()
            .map(|i| {
                let functions = self.functions.then(|| {
                    i.functions()
                        .map(|f| function_name(f, self.demangle))
                        .collect()
                });
                (
                    i.name().to_owned(),
                    JsonImport {
                        alias: i.alias().to_owned(),
                        unresolved: i.is_unresolved(),
                        functions,
                    },
                )
            })
            .collect();
        self.modules.insert(
            module.name().to_owned(),
            JsonModule {
                path: module.path().map(path_to_string),
                imports,
            },
        );
        Ok(())
    }
}

impl JsonView {
    fn write<W: Write + ?Sized>(&self, out: &mut W, indent: usize) -> Result<(), WalkError> {
        if indent == 0 {
            serde_json::to_writer(&mut *out, &self.modules)?;
        } else {
            let indent = vec![b' '; indent];
            let formatter = serde_json::ser::PrettyFormatter::with_indent(&indent);
            let mut ser = serde_json::Serializer::with_formatter(&mut *out, formatter);
            self.modules.serialize(&mut ser)?;
        }
        writeln!(out)?;
        Ok(())
    }
}

fn quoted(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\\\""))
}

struct DotView<'w, W: ?Sized> {
    out: &'w mut W,
    indent: usize,
}

impl<W: Write + ?Sized> Visitor<Module> for DotView<'_, W> {
    fn visit(&mut self, node: NodeRef<'_, Module>, _depth: usize) -> Result<(), WalkError> {
        let module = node.context();
        let imports: Vec<String> = module.imports().map(|i| quoted(i.name())).collect();
        writeln!(
            self.out,
            "{}{} -> {{{}}};",
            " ".repeat(self.indent),
            quoted(module.name()),
            imports.join(",")
        )?;
        Ok(())
    }
}

fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_owned()
    }
}

struct CsvView<'w, W: ?Sized> {
    out: &'w mut W,
}

impl<W: Write + ?Sized> Visitor<Module> for CsvView<'_, W> {
    fn visit(&mut self, node: NodeRef<'_, Module>, _depth: usize) -> Result<(), WalkError> {
        let module = node.context();
        for import in module.imports() {
            writeln!(
                self.out,
                "{},{}",
                csv_field(module.name()),
                csv_field(import.name())
            )?;
        }
        Ok(())
    }
}

/// Render the graph reachable from `root` to `out`
pub fn show<W: Write + ?Sized>(
    graph: &DependencyGraph<Module>,
    root: NodeId,
    out: &mut W,
    options: &ViewOptions,
) -> Result<(), WalkError> {
    match options.format {
        Format::Ascii => DepthFirst::pre_order().traverse(
            graph,
            root,
            &mut AsciiView {
                out: &mut *out,
                options,
            },
        )?,
        Format::Json => {
            let mut view = JsonView {
                functions: options.functions,
                demangle: options.demangle,
                ..JsonView::default()
            };
            BreadthFirst.traverse(graph, root, &mut view)?;
            view.write(&mut *out, options.indent)?;
        }
        Format::Dot => {
            writeln!(out, "digraph depwalk {{")?;
            DepthFirst::pre_order().traverse(
                graph,
                root,
                &mut DotView {
                    out: &mut *out,
                    indent: options.indent,
                },
            )?;
            writeln!(out, "}}")?;
        }
        Format::Csv => {
            writeln!(out, "Source,Target")?;
            BreadthFirst.traverse(graph, root, &mut CsvView { out: &mut *out })?;
        }
    }
    out.flush()?;
    Ok(())
}

/// Where the rendered graph goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Stdout,
    File(PathBuf),
}

impl Output {
    /// Standard output when no path (or an empty one) is given
    pub fn new(path: Option<PathBuf>) -> Self {
        match path {
            Some(p) if !p.as_os_str().is_empty() => Self::File(p),
            _ => Self::Stdout,
        }
    }

    pub fn open(&self) -> Result<Box<dyn Write>, WalkError> {
        Ok(match self {
            Self::Stdout => Box::new(io::stdout().lock()),
            Self::File(path) => Box::new(BufWriter::new(fs::File::create(path)?)),
        })
    }
}
