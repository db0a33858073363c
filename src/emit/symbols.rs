//! Debug symbol collaborators.
//!
//! Scopes, locals and sequence points are recorded while bodies are encoded
//! and replayed into a [`SymbolWriter`] once the image is complete, so the
//! writer sees final method tokens and can look names up in the finished
//! metadata through [`MetadataNames`].

use crate::{
    error::{Error, Result},
    image::Image,
    model::{
        module::{Document, Module},
        DocumentId,
    },
};
use tracing::trace;

/// Name lookups over finished metadata, keyed by token.
pub trait MetadataNames {
    /// Full name of a TypeDef.
    fn type_name(&self, token: u32) -> Option<String>;
    fn method_name(&self, token: u32) -> Option<String>;
    /// The TypeDef token owning a MethodDef.
    fn method_parent(&self, token: u32) -> Option<u32>;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SequencePoint {
    pub offset: u32,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

pub trait SymbolWriter {
    fn open_method(&mut self, token: u32, names: &dyn MetadataNames) -> Result<()>;
    fn open_scope(&mut self, offset: u32) -> Result<()>;
    fn close_scope(&mut self, offset: u32) -> Result<()>;
    fn define_local(&mut self, name: &str, slot: u32, signature: &[u8]) -> Result<()>;
    fn define_sequence_points(&mut self, document: &Document, points: &[SequencePoint]) -> Result<()>;
    fn close_method(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ScopeEvent {
    Open(u32),
    Local { name: String, slot: u32, signature: Vec<u8> },
    Close(u32),
}

#[derive(Debug, Clone)]
pub(crate) struct MethodDebug {
    pub token: u32,
    pub code_size: u32,
    pub scopes: Vec<ScopeEvent>,
    pub points: Vec<(DocumentId, SequencePoint)>,
}

pub(crate) fn replay(
    writer: &mut dyn SymbolWriter,
    module: &Module,
    image: &Image,
    methods: &[MethodDebug],
) -> Result<()> {
    for method in methods {
        trace!(token = method.token, points = method.points.len(), "replaying debug info");

        writer.open_method(method.token, image)?;
        writer.open_scope(0)?;

        for event in &method.scopes {
            match event {
                ScopeEvent::Open(offset) => writer.open_scope(*offset)?,
                ScopeEvent::Local { name, slot, signature } => writer.define_local(name, *slot, signature)?,
                ScopeEvent::Close(offset) => writer.close_scope(*offset)?,
            }
        }

        // one call per document, in order of first use
        let mut documents: Vec<DocumentId> = vec![];
        for (document, _) in &method.points {
            if !documents.contains(document) {
                documents.push(*document);
            }
        }
        for id in documents {
            let document = module
                .documents
                .get(id.0)
                .ok_or_else(|| Error::UnresolvedReference(format!("document {:?} is not in the module", id)))?;
            let points: Vec<_> = method
                .points
                .iter()
                .filter(|(d, _)| *d == id)
                .map(|(_, p)| *p)
                .collect();
            writer.define_sequence_points(document, &points)?;
        }

        writer.close_scope(method.code_size)?;
        writer.close_method()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        emit::{assemble, Collaborators, WriteOptions},
        model::{body::*, members::*, signature::*, types::*},
    };

    #[derive(Default)]
    struct Recording {
        calls: Vec<String>,
    }

    impl SymbolWriter for Recording {
        fn open_method(&mut self, token: u32, names: &dyn MetadataNames) -> Result<()> {
            let name = names.method_name(token).unwrap_or_default();
            let parent = names.method_parent(token).and_then(|t| names.type_name(t)).unwrap_or_default();
            self.calls.push(format!("method {:#010x} {}::{}", token, parent, name));
            Ok(())
        }

        fn open_scope(&mut self, offset: u32) -> Result<()> {
            self.calls.push(format!("open {}", offset));
            Ok(())
        }

        fn close_scope(&mut self, offset: u32) -> Result<()> {
            self.calls.push(format!("close {}", offset));
            Ok(())
        }

        fn define_local(&mut self, name: &str, slot: u32, signature: &[u8]) -> Result<()> {
            self.calls.push(format!("local {} {} {:?}", name, slot, signature));
            Ok(())
        }

        fn define_sequence_points(&mut self, document: &Document, points: &[SequencePoint]) -> Result<()> {
            let offsets: Vec<_> = points.iter().map(|p| p.offset).collect();
            self.calls.push(format!("points {} {:?}", document.url, offsets));
            Ok(())
        }

        fn close_method(&mut self) -> Result<()> {
            self.calls.push("end".to_string());
            Ok(())
        }
    }

    fn source(document: DocumentId, line: u32) -> SourceContext {
        SourceContext {
            document,
            start_line: line,
            start_column: 1,
            end_line: line,
            end_column: 10,
        }
    }

    fn module() -> Module {
        let mut module = Module::new("symbols.dll");
        let file = module.push_document(Document::new("main.src"));
        let program = module.push_type(TypeNode::new(Some("Demo"), "Program", TypeKind::Class));

        let mut root = Block::new(
            BlockId(0),
            vec![
                Statement::Assign {
                    target: Target::Local(0),
                    value: Expression::int(5),
                },
                Statement::SequencePoint(source(file, 2)),
                Statement::Return(None),
            ],
        );
        root.locals = vec![0];
        root.source = Some(source(file, 1));

        let mut body = Body::new(root);
        body.locals.push(LocalVariable::named("x", TypeSig::Int32));
        module.push_method(
            program,
            Method::with_body("Main", MethodSignature::static_member(TypeSig::Void, vec![]), body),
        );
        module
    }

    #[test]
    fn replays_scopes_and_points() -> Result<()> {
        let module = module();
        let options = WriteOptions {
            debug_symbols: true,
            ..WriteOptions::default()
        };
        let mut recording = Recording::default();
        let mut collaborators = Collaborators {
            symbols: Some(&mut recording),
            signer: None,
        };
        assemble(&module, &options, &mut collaborators)?;

        assert_eq!(
            recording.calls,
            [
                "method 0x06000001 Demo.Program::Main",
                "open 0",
                "open 0",
                "local x 0 [8]",
                "close 3",
                "points main.src [0, 2]",
                "close 3",
                "end",
            ]
        );
        Ok(())
    }

    #[test]
    fn requires_a_writer() {
        let options = WriteOptions {
            debug_symbols: true,
            ..WriteOptions::default()
        };
        let result = assemble(&module(), &options, &mut Collaborators::default());
        assert!(matches!(result, Err(Error::DebugSymbols(_))));
    }

    #[test]
    fn nothing_recorded_without_the_option() -> Result<()> {
        let mut recording = Recording::default();
        let mut collaborators = Collaborators {
            symbols: Some(&mut recording),
            signer: None,
        };
        assemble(&module(), &WriteOptions::default(), &mut collaborators)?;
        assert!(recording.calls.is_empty());
        Ok(())
    }
}
