#![allow(dead_code)]

use ilemit::prelude::*;
use once_cell::sync::Lazy;

/// A console program calling `System.Console.WriteLine(string)`.
pub static HELLO_WORLD: Lazy<Module> = Lazy::new(|| hello_world("Hello, world!"));

pub fn executable() -> WriteOptions {
    WriteOptions {
        is_executable: true,
        ..WriteOptions::default()
    }
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

pub struct Fixture {
    pub module: Module,
    pub program: TypeId,
    pub mscorlib: AssemblyRefId,
    pub console: TypeId,
}

pub fn fixture(name: &str) -> Fixture {
    let mut module = Module::new(format!("{}.exe", name));
    module.mvid = *b"ilemit-fixture!!";

    let mut assembly = Assembly::new(name);
    assembly.version = Version {
        major: 1,
        minor: 0,
        build: 0,
        revision: 0,
    };
    module.assembly = Some(assembly);

    let mscorlib = module.push_assembly_reference(AssemblyReference::new(
        "mscorlib",
        Version {
            major: 4,
            minor: 0,
            build: 0,
            revision: 0,
        },
    ));
    let object = module.push_type(TypeNode::external(
        Some("System"),
        "Object",
        TypeKind::Class,
        ResolutionScope::Assembly(mscorlib),
    ));
    let console = module.push_type(TypeNode::external(
        Some("System"),
        "Console",
        TypeKind::Class,
        ResolutionScope::Assembly(mscorlib),
    ));

    let mut class = TypeNode::new(None, "Program", TypeKind::Class);
    class.base = Some(TypeSig::Named(object));
    let program = module.push_type(class);

    Fixture {
        module,
        program,
        mscorlib,
        console,
    }
}

pub fn hello_world(message: &str) -> Module {
    let Fixture {
        mut module,
        program,
        console,
        ..
    } = fixture("hello_world");

    let write_line = module.push_method(
        console,
        Method::new(
            "WriteLine",
            MethodSignature::static_member(TypeSig::Void, vec![TypeSig::String]),
        ),
    );

    let body = Body::new(Block::new(
        BlockId(0),
        vec![Statement::Expression(Expression::call(
            write_line,
            vec![Expression::string(message)],
        ))],
    ));
    let main = module.push_method(
        program,
        Method::with_body(
            "Main",
            MethodSignature::static_member(TypeSig::Void, vec![TypeSig::vector(TypeSig::String)]),
            body,
        ),
    );
    module.entry_point = Some(main.into());

    module
}
