use keel::{KernelError, SystemConfigurationBuilder, fs::FileSystem, teletype};
use memfs::MemFs;
use std::sync::Arc;

#[test]
fn file_position_is_per_open_file() {
    let fs = MemFs::new().with_file("hello", b"Hello, keel!");
    let disk = fs.clone();
    SystemConfigurationBuilder::new()
        .quiet(true)
        .filesystem(Arc::new(fs))
        .boot(move || {
            assert!(FileSystem::is_available());
            let first = FileSystem::open("hello").unwrap();
            let second = FileSystem::open("hello").unwrap();
            assert_eq!(first.name(), "hello");
            assert_eq!(first.length(), 12);
            assert_eq!(first.ino(), second.ino());
            assert_eq!(disk.open_count("hello"), Some(2));

            let mut buf = [0; 5];
            assert_eq!(first.read(&mut buf), Ok(5));
            assert_eq!(&buf, b"Hello");
            assert_eq!(first.tell(), 5);
            assert_eq!(second.tell(), 0, "Each open file has its own position.");

            first.seek(7);
            assert_eq!(first.write(b"world"), Ok(5));
            assert_eq!(first.tell(), 12);
            assert_eq!(disk.contents("hello").unwrap(), b"Hello, world");

            second.seek(100);
            assert_eq!(
                second.read(&mut buf),
                Ok(0),
                "Reading past the end gives 0."
            );

            drop(first);
            assert_eq!(disk.open_count("hello"), Some(1));
            drop(second);
            assert_eq!(disk.open_count("hello"), Some(0));
        });
}

#[test]
fn create_and_remove() {
    SystemConfigurationBuilder::new()
        .quiet(true)
        .filesystem(Arc::new(MemFs::new()))
        .boot(|| {
            assert_eq!(FileSystem::create("new", 4), Ok(()));
            assert_eq!(FileSystem::create("new", 4), Err(KernelError::FileExist));
            assert_eq!(FileSystem::open("new").unwrap().length(), 4);
            assert_eq!(FileSystem::remove("new"), Ok(()));
            assert_eq!(
                FileSystem::open("new").err(),
                Some(KernelError::NoSuchEntry)
            );
        });
}

#[test]
fn no_filesystem() {
    SystemConfigurationBuilder::new().quiet(true).boot(|| {
        assert!(!FileSystem::is_available());
        assert_eq!(FileSystem::open("x").err(), Some(KernelError::NoSuchEntry));
    });
}

#[test]
fn console_input_and_output() {
    let shutdown = SystemConfigurationBuilder::new()
        .quiet(true)
        .stdin(b"ab")
        .boot(|| {
            assert_eq!(teletype::input_getc(), Some(b'a'));
            teletype::feed(b"c");
            assert_eq!(teletype::input_getc(), Some(b'b'));
            assert_eq!(teletype::input_getc(), Some(b'c'));
            assert_eq!(teletype::input_getc(), None, "Input is exhausted.");
            teletype::putbuf(b"hi ");
            teletype::putbuf(b"there");
            assert_eq!(teletype::output(), "hi there");
        });
    assert_eq!(shutdown.output, "hi there");
}
