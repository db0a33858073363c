use ilemit::prelude::*;
use tempfile::TempDir;

mod common;

#[test]
fn executable_image() -> Result<(), Box<dyn std::error::Error>> {
    let bytes = common::HELLO_WORLD.write(&common::executable())?;

    assert_eq!(&bytes[..2], b"MZ");
    assert!(common::contains(&bytes, b"BSJB"));
    assert!(common::contains(&bytes, b"Standard CLI 2005\0"));
    assert!(common::contains(&bytes, b"mscoree.dll\0"));
    // the program's name in the #Strings heap
    assert!(common::contains(&bytes, b"\0hello_world.exe\0"));
    Ok(())
}

#[test]
fn image_tables() -> Result<(), Box<dyn std::error::Error>> {
    let image = common::HELLO_WORLD.assemble(&common::executable())?;

    assert_eq!(image.tables.module.len(), 1);
    assert_eq!(image.tables.assembly.len(), 1);
    assert_eq!(image.tables.assembly_ref.len(), 1);
    // System.Object and System.Console
    assert_eq!(image.tables.type_ref.len(), 2);
    assert_eq!(image.tables.member_ref.len(), 1);
    assert_eq!(image.tables.type_def.len(), 2);
    assert_eq!(image.entry_point, 0x0600_0001);
    assert!(image.method_body(1).is_some());
    Ok(())
}

#[test]
fn metadata_version_is_configurable() -> Result<(), Box<dyn std::error::Error>> {
    let options = WriteOptions {
        metadata_version: "v4.0.30319".to_string(),
        ..common::executable()
    };
    let metadata = common::HELLO_WORLD.assemble(&options)?.metadata()?;

    assert_eq!(&metadata[..4], b"BSJB");
    // "v4.0.30319" plus NUL, padded to 12
    assert_eq!(metadata[12..16], [12, 0, 0, 0]);
    assert_eq!(&metadata[16..26], b"v4.0.30319");
    Ok(())
}

#[test]
fn same_bytes_on_disk() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let path = dir.path().join("hello_world.exe");

    common::HELLO_WORLD.write_to_path(&path, &common::executable())?;

    assert_eq!(std::fs::read(&path)?, common::HELLO_WORLD.write(&common::executable())?);
    Ok(())
}

#[test]
fn nothing_written_on_failure() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let path = dir.path().join("broken.exe");

    let options = WriteOptions {
        key_file: Some(dir.path().join("missing.snk")),
        ..common::executable()
    };
    let result = common::HELLO_WORLD.write_to_path(&path, &options);

    assert!(matches!(result, Err(Error::KeyFileNotFound(_))));
    assert!(!path.exists());
    Ok(())
}

#[test]
fn strong_name_key_from_file() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let key_path = dir.path().join("key.snk");
    let key: Vec<u8> = (0..160).map(|i| i as u8).collect();
    std::fs::write(&key_path, &key)?;

    let options = WriteOptions {
        key_file: Some(key_path),
        ..common::executable()
    };
    let image = common::HELLO_WORLD.assemble(&options)?;

    assert!(image.strong_name);
    // PublicKey flag
    assert_eq!(image.tables.assembly[0].flags & 0x1, 0x1);
    assert!(common::contains(&image.blobs, &key));
    Ok(())
}

#[test]
fn unresolved_types_fail_the_write() {
    let mut module = common::hello_world("unused");
    let missing = module.push_type(TypeNode {
        scope: TypeScope::Unresolved,
        ..TypeNode::new(Some("Nowhere"), "Missing", TypeKind::Class)
    });
    let program = common::fixture("x").program;
    module.types[program.0].base = Some(TypeSig::Named(missing));

    let result = module.write(&common::executable());
    assert!(matches!(result, Err(Error::UnresolvedReference(_))));
}
