use crate::{
    binary::index,
    emit::WriteOptions,
    model::{attribute::*, body::*, members::*, module::*, signature::*, types::*, Accessibility},
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn empty_block() -> Block {
    Block::new(BlockId(0), vec![])
}

fn program(name: &str) -> (Module, crate::model::TypeId) {
    let mut module = Module::new(format!("{}.dll", name));
    module.mvid = [0x42; 16];
    module.assembly = Some(Assembly::new(name));
    let class = module.push_type(TypeNode::new(Some("Tests"), "Program", TypeKind::Class));
    (module, class)
}

#[test]
fn empty_void_method() -> TestResult {
    let (mut module, class) = program("empty");
    module.push_method(
        class,
        Method::with_body(
            "Run",
            MethodSignature::static_member(TypeSig::Void, vec![]),
            Body::new(empty_block()),
        ),
    );

    let image = module.assemble(&WriteOptions::default())?;

    // <Module> and Program
    assert_eq!(image.tables.type_def.len(), 2);
    assert_eq!(image.tables.method_def.len(), 1);
    assert_eq!(image.tables.type_def[1].method_list.0, 1);
    assert!(image.tables.param.is_empty());
    assert_eq!(image.tables.method_def[0].param_list.0, 1);
    // tiny header, code size 1, then ret
    assert_eq!(image.method_body(1).ok_or("no body")?, [0x06, 0x2A]);
    Ok(())
}

#[test]
fn local_assigned_and_returned() -> TestResult {
    let (mut module, class) = program("locals");
    let mut body = Body::new(Block::new(
        BlockId(0),
        vec![
            Statement::Assign {
                target: Target::Local(0),
                value: Expression::int(5),
            },
            Statement::Return(Some(Expression::Local(0))),
        ],
    ));
    body.locals.push(LocalVariable::new(TypeSig::Int32));
    module.push_method(
        class,
        Method::with_body("Five", MethodSignature::static_member(TypeSig::Int32, vec![]), body),
    );

    let image = module.assemble(&WriteOptions::default())?;
    let bytes = image.method_body(1).ok_or("no body")?;

    // fat header: flags and size, max stack 1, code size 4, StandAloneSig 1
    assert_eq!(bytes[..2], [0x03, 0x30]);
    assert_eq!(bytes[2..4], [0x01, 0x00]);
    assert_eq!(bytes[4..8], [0x04, 0, 0, 0]);
    assert_eq!(bytes[8..12], [0x01, 0, 0, 0x11]);
    // ldc.i4.5; stloc.0; ldloc.0; ret
    assert_eq!(bytes[12..], [0x1B, 0x0A, 0x06, 0x2A]);
    assert_eq!(image.tables.stand_alone_sig.len(), 1);
    Ok(())
}

#[test]
fn try_catch_uses_a_fat_header() -> TestResult {
    let (mut module, class) = program("handlers");
    let mscorlib = module.push_assembly_reference(AssemblyReference::new(
        "mscorlib",
        Version {
            major: 4,
            minor: 0,
            build: 0,
            revision: 0,
        },
    ));
    let exception = module.push_type(TypeNode::external(
        Some("System"),
        "Exception",
        TypeKind::Class,
        ResolutionScope::Assembly(mscorlib),
    ));

    let body = Body::new(Block::new(
        BlockId(0),
        vec![Statement::Try(TryStatement {
            body: Block::new(BlockId(1), vec![Statement::Nop]),
            handlers: vec![Handler::Catch {
                exception_type: TypeSig::Named(exception),
                variable: None,
                block: Block::new(BlockId(2), vec![]),
            }],
            finally: None,
        })],
    ));
    module.push_method(
        class,
        Method::with_body("Guarded", MethodSignature::static_member(TypeSig::Void, vec![]), body),
    );

    let image = module.assemble(&WriteOptions::default())?;
    let bytes = image.method_body(1).ok_or("no body")?;

    // fat, MoreSects, code size 7
    assert_eq!(bytes[..2], [0x0B, 0x30]);
    assert_eq!(bytes[4..8], [0x07, 0, 0, 0]);
    // nop; leave.s +3; pop; leave.s +0; ret
    assert_eq!(bytes[12..19], [0x00, 0xDE, 0x03, 0x26, 0xDE, 0x00, 0x2A]);
    // small EH section at the next 4-byte boundary
    assert_eq!(bytes[19], 0);
    assert_eq!(bytes[20..24], [0x01, 16, 0, 0]);
    // typed clause: try 0+3, handler 3+3, catching TypeRef 1
    assert_eq!(bytes[24..36], [0x00, 0x00, 0x00, 0x00, 0x03, 0x03, 0x00, 0x03, 0x01, 0x00, 0x00, 0x01]);
    assert_eq!(image.tables.type_ref.len(), 1);
    assert_eq!(image.tables.assembly_ref.len(), 1);
    Ok(())
}

#[test]
fn calls_through_member_references() -> TestResult {
    let (mut module, class) = program("hello");
    let mscorlib = module.push_assembly_reference(AssemblyReference::new("mscorlib", Version::ZERO));
    let console = module.push_type(TypeNode::external(
        Some("System"),
        "Console",
        TypeKind::Class,
        ResolutionScope::Assembly(mscorlib),
    ));
    let write_line = module.push_method(
        console,
        Method::new("WriteLine", MethodSignature::static_member(TypeSig::Void, vec![TypeSig::String])),
    );

    let body = Body::new(Block::new(
        BlockId(0),
        vec![Statement::Expression(Expression::call(
            write_line,
            vec![Expression::string("Hello, world!")],
        ))],
    ));
    let main = module.push_method(
        class,
        Method::with_body("Main", MethodSignature::static_member(TypeSig::Void, vec![]), body),
    );
    module.entry_point = Some(EntryPoint::Method(main));

    let image = module.assemble(&WriteOptions::default())?;

    assert_eq!(image.tables.member_ref.len(), 1);
    assert_eq!(image.tables.method_def.len(), 1);
    assert_eq!(image.entry_point, 0x0600_0001);
    // ldstr; call; ret
    assert_eq!(
        image.method_body(1).ok_or("no body")?,
        [0x2E, 0x72, 0x01, 0x00, 0x00, 0x70, 0x28, 0x01, 0x00, 0x00, 0x0A, 0x2A]
    );
    // length prefix, UTF-16 text, then a zero flag byte for plain ASCII
    assert_eq!(image.user_strings[1], 27);
    assert_eq!(image.user_strings[2..4], [b'H', 0]);
    assert_eq!(image.user_strings[28], 0);
    Ok(())
}

#[test]
fn primitives_resolve_to_core_library_type_refs() -> TestResult {
    let (mut module, class) = program("boxing");
    let mscorlib = module.push_assembly_reference(AssemblyReference::new("mscorlib", Version::ZERO));
    module.types[class.0].base = Some(TypeSig::Object);

    let body = Body::new(Block::new(
        BlockId(0),
        vec![Statement::Return(Some(Expression::BoxValue {
            value_type: TypeSig::Int32,
            operand: Box::new(Expression::int(5)),
        }))],
    ));
    module.push_method(
        class,
        Method::with_body("Boxed", MethodSignature::static_member(TypeSig::Object, vec![]), body),
    );

    assert!(matches!(
        module.assemble(&WriteOptions::default()),
        Err(crate::Error::UnresolvedReference(_))
    ));

    module.core_library = Some(mscorlib);
    let image = module.assemble(&WriteOptions::default())?;

    assert!(image.tables.type_spec.is_empty());
    assert_eq!(image.tables.type_ref.len(), 2);
    assert!(image
        .tables
        .type_ref
        .iter()
        .all(|r| r.resolution_scope == index::ResolutionScope::AssemblyRef(1)));
    assert!(matches!(image.tables.type_def[1].extends, index::TypeDefOrRef::TypeRef(_)));

    // ldc.i4.5; box TypeRef; ret
    let bytes = image.method_body(1).ok_or("no body")?;
    assert_eq!(bytes[1..3], [0x1B, 0x8C]);
    assert_eq!(bytes[6..], [0x01, 0x2A]);
    Ok(())
}

fn busy_module() -> Module {
    let (mut module, class) = program("busy");

    let marker = module.push_type(TypeNode::new(Some("Tests"), "MarkerAttribute", TypeKind::Class));
    let ctor = module.push_method(marker, Method::constructor(vec![], Some(Body::new(empty_block()))));

    let nested = module.push_nested_type(class, TypeNode::new(None, "Inner", TypeKind::Class));
    module.types[nested.0].flags.accessibility = TypeAccessibility::Nested(Accessibility::Public);
    module.types[nested.0].attributes.push(Attribute::new(ctor, vec![]));

    let mut limit = Field::static_member("Limit", TypeSig::Int32);
    limit.literal = true;
    limit.default = Some(Constant::Int32(10));
    module.push_field(nested, limit);

    let mut name = Field::static_member("Name", TypeSig::String);
    name.literal = true;
    name.default = Some(Constant::String("busy".to_string()));
    name.attributes.push(Attribute::new(ctor, vec![]));
    module.push_field(class, name);

    module.types[class.0].attributes.push(Attribute::new(ctor, vec![]));
    module.attributes.push(Attribute::new(ctor, vec![]));

    module
}

#[test]
fn sorted_tables_after_population() -> TestResult {
    let image = busy_module().assemble(&WriteOptions::default())?;
    let tables = &image.tables;

    assert_eq!(tables.constant.len(), 2);
    assert!(tables.constant.windows(2).all(|w| w[0].parent <= w[1].parent));

    assert_eq!(tables.custom_attribute.len(), 4);
    assert!(tables
        .custom_attribute
        .windows(2)
        .all(|w| w[0].parent <= w[1].parent));
    // coded order puts Field 1 ahead of Module 1
    assert_eq!(tables.custom_attribute[0].parent, index::HasCustomAttribute::Field(1));
    assert_eq!(tables.custom_attribute[1].parent, index::HasCustomAttribute::Module(1));

    assert_eq!(tables.nested_class.len(), 1);
    // Program, then Inner right after it
    assert_eq!(tables.nested_class[0].nested_class.0, 3);
    assert_eq!(tables.nested_class[0].enclosing_class.0, 2);
    Ok(())
}

#[test]
fn output_is_reproducible() -> TestResult {
    let module = busy_module();
    let options = WriteOptions {
        is_executable: true,
        ..WriteOptions::default()
    };

    let first = module.write(&options)?;
    let second = module.write(&options)?;
    assert_eq!(first, second);
    assert_eq!(module.assemble(&options)?.metadata()?, module.assemble(&options)?.metadata()?);
    Ok(())
}
