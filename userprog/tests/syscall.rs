use keel::{
    SystemConfigurationBuilder,
    addressing::{KERNEL_BASE, PAGE_SIZE},
};
use keel_userprog::{
    SyscallNumber,
    file_struct::MAX_FD,
    loader::{DATA_BASE, Program, ProgramTable},
    process_execute,
    syscall,
    usys,
};
use memfs::MemFs;
use std::sync::Arc;

/// Boots a machine, runs `program` as the first process and returns its exit
/// status (if it exited) and the console output.
fn run_with(fs: MemFs, stdin: &[u8], program: Program) -> (Option<i32>, String) {
    let cmdline = program.name().to_string();
    let programs = Arc::new(ProgramTable::new().with(program));
    let mut status = None;
    let shutdown = SystemConfigurationBuilder::new()
        .quiet(true)
        .stdin(stdin)
        .filesystem(Arc::new(fs))
        .boot(|| {
            let waiter = process_execute(&programs, &cmdline)
                .expect("the program exists");
            status = Some(waiter.wait());
        });
    (status, shutdown.output)
}

fn run(fs: MemFs, program: Program) -> (i32, String) {
    let (status, output) = run_with(fs, b"", program);
    (status.expect("the process must exit"), output)
}

#[test]
fn open_missing_file() {
    fn main(_: usize, _: usize) -> i32 {
        assert_eq!(
            usys::open("x.txt"),
            -1,
            "Opening a non-existent file should fail."
        );
        assert_eq!(
            usys::open("hello"),
            2,
            "A failed open must not consume a descriptor."
        );
        0
    }
    let (status, output) = run(
        MemFs::new().with_file("hello", b"hi"),
        Program::new("open-missing", main),
    );
    assert_eq!(status, 0);
    assert_eq!(output, "open-missing: exit(0)\n");
}

#[test]
fn open_close_reuses_descriptor() {
    fn main(_: usize, _: usize) -> i32 {
        let a = usys::open("f");
        let b = usys::open("f");
        assert_eq!((a, b), (2, 3));
        usys::close(a);
        assert_eq!(usys::open("f"), a, "A closed descriptor should be reused.");
        assert_eq!(usys::open("f"), 4);
        0
    }
    let (status, _) = run(
        MemFs::new().with_file("f", b""),
        Program::new("reuse", main),
    );
    assert_eq!(status, 0);
}

#[test]
fn open_bad_string_terminates() {
    fn main(_: usize, _: usize) -> i32 {
        let page = usys::alloc(PAGE_SIZE);
        assert_eq!(page, DATA_BASE);
        usys::store(page + PAGE_SIZE - 3, b"abc");
        syscall!(SyscallNumber::Open, page + PAGE_SIZE - 3);
        unreachable!("the string runs into an unmapped page")
    }
    let (status, output) = run(MemFs::new(), Program::new("open-bad-str", main));
    assert_eq!(status, -1);
    assert_eq!(output, "open-bad-str: exit(-1)\n");
}

#[test]
fn too_many_open_files() {
    fn main(_: usize, _: usize) -> i32 {
        let mut opened = 0;
        while usys::open("f") != -1 {
            opened += 1;
        }
        opened
    }
    let fs = MemFs::new().with_file("f", b"");
    let disk = fs.clone();
    let (status, _) = run(fs, Program::new("many", main));
    assert_eq!(status, MAX_FD - 2, "Descriptors 2..512 are openable.");
    assert_eq!(disk.open_count("f"), Some(0), "Exit must close every file.");
}

#[test]
fn write_to_console() {
    fn main(_: usize, _: usize) -> i32 {
        assert_eq!(usys::write_str(1, "hi\n"), 3);
        0
    }
    let (status, output) = run(MemFs::new(), Program::new("write-console", main));
    assert_eq!(status, 0);
    assert_eq!(output, "hi\nwrite-console: exit(0)\n");
}

#[test]
fn write_edge_cases() {
    fn main(_: usize, _: usize) -> i32 {
        let buf = usys::stage(b"x");
        assert_eq!(usys::write(1, buf, 0), 0);
        assert_eq!(
            usys::write(1, 0, 0),
            0,
            "Writing nothing never touches the buffer."
        );
        assert_eq!(
            usys::write(0, buf, 1),
            -1,
            "Standard input is not writable."
        );
        assert_eq!(usys::write(MAX_FD, buf, 1), -1);
        assert_eq!(usys::write(-1, buf, 1), -1);
        assert_eq!(
            usys::write(5, buf, 1),
            1,
            "An unopened descriptor is the console."
        );
        0
    }
    let (status, output) = run(MemFs::new(), Program::new("write-edge", main));
    assert_eq!(status, 0);
    assert_eq!(output, "xwrite-edge: exit(0)\n");
}

#[test]
fn write_bad_pointer_terminates() {
    fn main(_: usize, _: usize) -> i32 {
        usys::write(1, KERNEL_BASE, 4);
        unreachable!("a kernel address must be rejected")
    }
    let (status, output) = run(MemFs::new(), Program::new("write-bad-ptr", main));
    assert_eq!(status, -1);
    assert_eq!(output, "write-bad-ptr: exit(-1)\n");
}

#[test]
fn write_into_unmapped_page_terminates() {
    fn main(_: usize, _: usize) -> i32 {
        usys::alloc(8);
        usys::write(1, DATA_BASE + PAGE_SIZE - 2, 4);
        unreachable!("the buffer runs into an unmapped page")
    }
    let (status, output) = run(MemFs::new(), Program::new("write-partial", main));
    assert_eq!(status, -1);
    assert_eq!(
        output,
        "write-partial: exit(-1)\n",
        "Nothing may be written."
    );
}

#[test]
fn read_unopened_fd_terminates() {
    fn main(_: usize, _: usize) -> i32 {
        let buf = usys::alloc(100);
        usys::read(3, buf, 100);
        unreachable!("descriptor 3 is not open")
    }
    let (status, output) = run(MemFs::new(), Program::new("read-bad-fd", main));
    assert_eq!(status, -1);
    assert_eq!(output, "read-bad-fd: exit(-1)\n");
}

#[test]
fn read_stdout_terminates() {
    fn main(_: usize, _: usize) -> i32 {
        let buf = usys::alloc(1);
        usys::read(1, buf, 1);
        unreachable!("standard output is not readable")
    }
    let (status, _) = run(MemFs::new(), Program::new("read-stdout", main));
    assert_eq!(status, -1);
}

#[test]
fn read_out_of_range_fd_terminates() {
    fn main(_: usize, _: usize) -> i32 {
        let buf = usys::alloc(1);
        usys::read(MAX_FD, buf, 1);
        unreachable!("descriptor 512 does not exist")
    }
    let (status, _) = run(MemFs::new(), Program::new("read-range", main));
    assert_eq!(status, -1);
}

#[test]
fn read_buffer_end_is_checked() {
    fn main(_: usize, _: usize) -> i32 {
        usys::alloc(16);
        usys::read(0, DATA_BASE + PAGE_SIZE - 10, 100);
        unreachable!("the last byte of the buffer is unmapped")
    }
    let (status, _) = run_with(MemFs::new(), b"never read", Program::new("read-end", main));
    assert_eq!(status, Some(-1));
}

#[test]
fn read_null_buffer_terminates() {
    fn main(_: usize, _: usize) -> i32 {
        usys::read(0, 0, 10);
        unreachable!("null is never a valid buffer")
    }
    let (status, _) = run(MemFs::new(), Program::new("read-null", main));
    assert_eq!(status, -1);
}

#[test]
fn read_console() {
    fn main(_: usize, _: usize) -> i32 {
        let buf = usys::alloc(8);
        assert_eq!(
            usys::read(0, buf, 8),
            3,
            "A short read at the end of input."
        );
        assert_eq!(usys::fetch(buf, 3), b"abc");
        assert_eq!(usys::read(0, buf, 8), 0);
        assert_eq!(usys::read(0, buf, 0), 0);
        0
    }
    let (status, _) = run_with(MemFs::new(), b"abc", Program::new("read-console", main));
    assert_eq!(status, Some(0));
}

#[test]
fn file_io() {
    fn main(_: usize, _: usize) -> i32 {
        let fd = usys::open("data");
        assert_eq!(usys::filesize(fd), 10);
        let buf = usys::alloc(4);
        assert_eq!(usys::read(fd, buf, 4), 4);
        assert_eq!(usys::fetch(buf, 4), b"0123");
        assert_eq!(usys::tell(fd), 4);
        assert_eq!(usys::seek(fd, 8), 0);
        assert_eq!(
            usys::read(fd, buf, 4),
            2,
            "A short read at the end of the file."
        );
        assert_eq!(usys::fetch(buf, 2), b"89");
        assert_eq!(usys::read(fd, buf, 4), 0);
        usys::seek(fd, 0);
        assert_eq!(usys::write_str(fd, "ab"), 2);
        usys::close(fd);
        assert_eq!(usys::filesize(fd), -1, "A closed descriptor has no size.");
        assert_eq!(usys::tell(fd), -1);
        assert_eq!(usys::seek(fd, 0), -1);
        assert_eq!(usys::filesize(MAX_FD), -1);
        0
    }
    let fs = MemFs::new().with_file("data", b"0123456789");
    let disk = fs.clone();
    let (status, _) = run(fs, Program::new("file-io", main));
    assert_eq!(status, 0);
    assert_eq!(disk.contents("data").unwrap(), b"ab23456789");
}

#[test]
fn create_and_remove() {
    fn main(_: usize, _: usize) -> i32 {
        assert!(usys::create("new", 0));
        assert!(!usys::create("new", 0), "The name is taken.");
        assert!(!usys::create("", 0));
        assert!(!usys::create("much-too-long-name", 0));
        let fd = usys::open("new");
        assert_eq!(fd, 2);
        assert_eq!(usys::filesize(fd), 0);
        assert!(usys::remove("new"));
        assert!(!usys::remove("new"));
        assert_eq!(usys::open("new"), -1);
        assert_eq!(
            usys::write_str(fd, "still open"),
            10,
            "A removed file stays usable through open descriptors."
        );
        assert!(usys::create("sized", 7));
        let sized = usys::open("sized");
        assert_eq!(usys::filesize(sized), 7);
        0
    }
    let (status, _) = run(MemFs::new(), Program::new("create", main));
    assert_eq!(status, 0);
}

#[test]
fn create_bad_pointer_terminates() {
    fn main(_: usize, _: usize) -> i32 {
        syscall!(SyscallNumber::Create, 0, 0);
        unreachable!("null is never a valid string")
    }
    let (status, _) = run(MemFs::new(), Program::new("create-null", main));
    assert_eq!(status, -1);
}

#[test]
fn dup2_same_fd_is_idempotent() {
    fn main(_: usize, _: usize) -> i32 {
        let fd = usys::open("data");
        assert_eq!(usys::dup2(fd, fd), fd);
        let buf = usys::alloc(2);
        assert_eq!(usys::read(fd, buf, 2), 2);
        assert_eq!(
            usys::open("data"),
            3,
            "dup2(fd, fd) must not change the table."
        );
        0
    }
    let fs = MemFs::new().with_file("data", b"0123");
    let (status, _) = run(fs, Program::new("dup2-same", main));
    assert_eq!(status, 0);
}

#[test]
fn dup2_keeps_the_file_open() {
    fn main(_: usize, _: usize) -> i32 {
        let fd = usys::open("data");
        assert_eq!(usys::dup2(fd, 10), 10);
        usys::close(10);
        let buf = usys::alloc(2);
        assert_eq!(
            usys::read(fd, buf, 2),
            2,
            "Closing a duplicate must not close the other descriptor."
        );
        assert_eq!(usys::dup2(fd, 11), 11);
        assert_eq!(usys::read(11, buf, 2), 2);
        assert_eq!(usys::tell(fd), 4, "Duplicates share the position.");
        assert_eq!(usys::fetch(buf, 2), b"23");
        0
    }
    let fs = MemFs::new().with_file("data", b"0123");
    let disk = fs.clone();
    let (status, _) = run(fs, Program::new("dup2-keep", main));
    assert_eq!(status, 0);
    assert_eq!(disk.open_count("data"), Some(0));
}

#[test]
fn dup2_redirects_stdout() {
    fn main(_: usize, _: usize) -> i32 {
        let fd = usys::open("log");
        assert_eq!(usys::dup2(fd, 1), 1);
        assert_eq!(usys::write_str(1, "to file"), 7);
        usys::close(1);
        assert_eq!(usys::write_str(1, "to console"), 10);
        usys::close(fd);
        0
    }
    let fs = MemFs::new().with_file("log", b"");
    let disk = fs.clone();
    let (status, output) = run(fs, Program::new("redirect", main));
    assert_eq!(status, 0);
    assert_eq!(disk.contents("log").unwrap(), b"to file");
    assert_eq!(output, "to consoleredirect: exit(0)\n");
}

#[test]
fn dup2_errors() {
    fn main(_: usize, _: usize) -> i32 {
        let fd = usys::open("data");
        assert_eq!(usys::dup2(fd, MAX_FD), -1);
        assert_eq!(usys::dup2(-1, 3), -1);
        assert_eq!(usys::dup2(600, 600), -1);
        assert_eq!(
            usys::dup2(20, fd),
            fd,
            "Duplicating an empty slot closes the target."
        );
        assert_eq!(usys::filesize(fd), -1);
        0
    }
    let (status, _) = run(
        MemFs::new().with_file("data", b""),
        Program::new("dup2-err", main),
    );
    assert_eq!(status, 0);
}

#[test]
fn close_is_lenient() {
    fn main(_: usize, _: usize) -> i32 {
        usys::close(-1);
        usys::close(MAX_FD);
        usys::close(7);
        usys::close(1);
        assert_eq!(usys::write_str(1, "ok"), 2);
        0
    }
    let (status, output) = run(MemFs::new(), Program::new("close", main));
    assert_eq!(status, 0);
    assert_eq!(output, "okclose: exit(0)\n");
}

#[test]
fn unknown_syscall_terminates() {
    fn main(_: usize, _: usize) -> i32 {
        syscall!(99);
        unreachable!("99 is not a system call")
    }
    let (status, output) = run(MemFs::new(), Program::new("nosys", main));
    assert_eq!(status, -1);
    assert_eq!(output, "nosys: exit(-1)\n");
}

#[test]
fn halt_powers_off() {
    fn main(_: usize, _: usize) -> i32 {
        usys::write_str(1, "bye");
        usys::halt()
    }
    let (status, output) = run_with(MemFs::new(), b"", Program::new("halt", main));
    assert_eq!(status, None, "Nobody returns from halt.");
    assert_eq!(output, "bye");
}
