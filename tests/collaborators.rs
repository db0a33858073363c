use ilemit::prelude::*;
use std::cell::RefCell;

mod common;

#[derive(Default)]
struct Calls(Vec<String>);

impl SymbolWriter for Calls {
    fn open_method(&mut self, token: u32, names: &dyn MetadataNames) -> ilemit::Result<()> {
        let parent = names.method_parent(token).and_then(|t| names.type_name(t));
        self.0.push(format!(
            "{}::{}",
            parent.unwrap_or_default(),
            names.method_name(token).unwrap_or_default()
        ));
        Ok(())
    }

    fn open_scope(&mut self, offset: u32) -> ilemit::Result<()> {
        self.0.push(format!("open {}", offset));
        Ok(())
    }

    fn close_scope(&mut self, offset: u32) -> ilemit::Result<()> {
        self.0.push(format!("close {}", offset));
        Ok(())
    }

    fn define_local(&mut self, name: &str, slot: u32, _signature: &[u8]) -> ilemit::Result<()> {
        self.0.push(format!("local {} {}", name, slot));
        Ok(())
    }

    fn define_sequence_points(&mut self, document: &Document, points: &[SequencePoint]) -> ilemit::Result<()> {
        for point in points {
            self.0.push(format!("{}:{} @{}", document.url, point.start_line, point.offset));
        }
        Ok(())
    }

    fn close_method(&mut self) -> ilemit::Result<()> {
        self.0.push("end".to_string());
        Ok(())
    }
}

fn with_sequence_points() -> Module {
    let mut module = common::hello_world("points");
    let document = module.push_document(Document::new("program.src"));

    let main = MethodId::new(common::fixture("x").program, 0);
    let method = &mut module.types[main.parent_type.0].methods[main.index];
    if let Some(body) = &mut method.body {
        body.root.source = Some(SourceContext {
            document,
            start_line: 3,
            start_column: 5,
            end_line: 3,
            end_column: 40,
        });
    }
    module
}

#[test]
fn symbol_writer_sees_final_tokens() -> Result<(), Box<dyn std::error::Error>> {
    let options = WriteOptions {
        debug_symbols: true,
        ..common::executable()
    };
    let mut calls = Calls::default();
    with_sequence_points().write_with(
        &options,
        Collaborators {
            symbols: Some(&mut calls),
            signer: None,
        },
    )?;

    assert_eq!(
        calls.0,
        ["Program::Main", "open 0", "program.src:3 @0", "close 11", "end"]
    );
    Ok(())
}

struct Recorder {
    signed: RefCell<usize>,
}

impl Signer for Recorder {
    fn signature_size(&self) -> usize {
        256
    }

    fn sign(&self, image: &[u8]) -> ilemit::Result<Vec<u8>> {
        *self.signed.borrow_mut() += 1;
        if !common::contains(image, b"BSJB") {
            return Err(Error::SigningFailed("no metadata".to_string()));
        }
        Ok(vec![0x5E; 256])
    }
}

#[test]
fn signer_runs_once_for_strong_named_assemblies() -> Result<(), Box<dyn std::error::Error>> {
    let mut module = common::hello_world("signed");
    if let Some(assembly) = &mut module.assembly {
        assembly.public_key = Some(vec![0x11; 160]);
    }

    let signer = Recorder { signed: RefCell::new(0) };
    let bytes = module.write_with(
        &common::executable(),
        Collaborators {
            symbols: None,
            signer: Some(&signer),
        },
    )?;

    assert_eq!(*signer.signed.borrow(), 1);
    assert!(common::contains(&bytes, &[0x5E; 256]));
    Ok(())
}

#[test]
fn signer_is_skipped_without_a_public_key() -> Result<(), Box<dyn std::error::Error>> {
    let signer = Recorder { signed: RefCell::new(0) };
    common::HELLO_WORLD.write_with(
        &common::executable(),
        Collaborators {
            symbols: None,
            signer: Some(&signer),
        },
    )?;

    assert_eq!(*signer.signed.borrow(), 0);
    Ok(())
}
