//! Byte-level checks of the emitted jitdump stream.

use opal_jitdump::dwarf::{EH_FRAME_HDR_SIZE, EhFrame, round_up};
use opal_jitdump::{CODE_PADDING, JitdumpFile, arch};

struct Record<'a> {
    kind: u32,
    size: u32,
    body: &'a [u8],
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn u64_at(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

fn parse_records(mut bytes: &[u8]) -> Vec<Record<'_>> {
    let mut records = Vec::new();
    while !bytes.is_empty() {
        let kind = u32_at(bytes, 0);
        let size = u32_at(bytes, 4);
        records.push(Record {
            kind,
            size,
            body: &bytes[16..size as usize],
        });
        bytes = &bytes[size as usize..];
    }
    records
}

#[test]
fn stream_layout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jit.dump");
    let jitdump = JitdumpFile::with_path(&path).unwrap();

    let stubs: [&[u8]; 3] = [&[0x90; 96], &[0xcc; 64], &[0xc3; 48]];
    let names = ["py::f:a.py", "py:::", "py::outer.<locals>.inner:b.py"];
    for (name, stub) in names.iter().zip(stubs) {
        jitdump.write_entry(name, stub).unwrap();
    }

    let bytes = std::fs::read(&path).unwrap();

    // File header.
    assert_eq!(u32_at(&bytes, 0), 0x4A69_5444);
    assert_eq!(u32_at(&bytes, 4), 1);
    assert_eq!(u32_at(&bytes, 8), 40);
    assert_eq!(u32_at(&bytes, 12), arch::ELF_MACHINE);
    assert_eq!(u32_at(&bytes, 16), 0);
    assert_eq!(u32_at(&bytes, 20), std::process::id());

    let records = parse_records(&bytes[40..]);
    assert_eq!(records.len(), 6);

    for (i, (name, stub)) in names.iter().zip(stubs).enumerate() {
        let unwind = &records[i * 2];
        let load = &records[i * 2 + 1];

        // Unwind info precedes the code load and both are 8-byte multiples.
        assert_eq!(unwind.kind, 4);
        assert_eq!(load.kind, 0);
        assert_eq!(unwind.size % 8, 0);
        assert_eq!(load.size % 8, 0);

        let eh_frame = EhFrame::new(stub.len() as u32);
        let unwind_data_size = u64_at(unwind.body, 0);
        assert_eq!(unwind_data_size, (EH_FRAME_HDR_SIZE + eh_frame.len()) as u64);
        assert!(unwind_data_size <= CODE_PADDING as u64);
        assert_eq!(u64_at(unwind.body, 8), EH_FRAME_HDR_SIZE as u64);
        assert_eq!(u64_at(unwind.body, 16), round_up(unwind_data_size, 16));
        // The CIE/FDE bytes land right after the fixed fields.
        assert_eq!(&unwind.body[24..24 + eh_frame.len()], eh_frame.bytes());

        assert_eq!(u32_at(load.body, 0), std::process::id());
        let vma = u64_at(load.body, 8);
        assert_eq!(vma, stub.as_ptr() as u64);
        assert_eq!(u64_at(load.body, 16), vma);
        assert_eq!(u64_at(load.body, 24), stub.len() as u64);
        assert_eq!(u64_at(load.body, 32), i as u64 + 1);

        let tail = &load.body[40..];
        assert_eq!(&tail[..name.len()], name.as_bytes());
        assert_eq!(tail[name.len()], 0);
        assert_eq!(&tail[name.len() + 1..name.len() + 1 + stub.len()], stub);
    }
}

#[test]
fn drop_unmaps_and_flushes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jit.dump");
    let jitdump = JitdumpFile::with_path(&path).unwrap();
    jitdump.write_entry("py::f:a.py", &[0x90; 16]).unwrap();
    drop(jitdump);

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(u32_at(&bytes, 0), 0x4A69_5444);
    let records = parse_records(&bytes[40..]);
    assert_eq!(records.len(), 2);
}
