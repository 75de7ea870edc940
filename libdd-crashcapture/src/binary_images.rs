// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Loaded ELF images, read from `/proc/self/maps` without locks or allocation.
//!
//! A file-backed mapping at offset 0 that starts with the ELF magic opens an image, which then
//! grows over the following mappings of the same file. Headers and notes are read from memory
//! through [`crate::memory`], so a half-unmapped library cannot fault the reader.

use crate::memory::{copy_safely, read_value};
use crate::shared::constants::MAX_PATH_LENGTH;
use crate::shared::fixed_string::FixedString;
use crate::shared::raw_io::{BufferedReader, RawFile};
use std::ops::ControlFlow;

/// ELF `e_machine` of the running code.
#[cfg(target_arch = "x86_64")]
pub const NATIVE_CPU_TYPE: i64 = 62;
#[cfg(target_arch = "aarch64")]
pub const NATIVE_CPU_TYPE: i64 = 183;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const NATIVE_CPU_TYPE: i64 = 0;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const PT_LOAD: u32 = 1;
const PT_NOTE: u32 = 4;
const NT_GNU_BUILD_ID: u32 = 3;
const MAX_NOTES_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct BinaryImage {
    /// Where the image is mapped.
    pub address: usize,
    /// Lowest virtual address of its loadable segments, as linked.
    pub vm_address: usize,
    pub size: usize,
    pub name: FixedString<MAX_PATH_LENGTH>,
    pub uuid: [u8; 16],
    pub cpu_type: i64,
    pub cpu_subtype: i64,
    pub major_version: u64,
    pub minor_version: u64,
    pub revision_version: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NoteHeader {
    name_size: u32,
    desc_size: u32,
    kind: u32,
}

/// One line of `/proc/self/maps`.
struct Mapping<'a> {
    start: usize,
    end: usize,
    offset: u64,
    path: &'a [u8],
}

fn parse_hex(text: &[u8]) -> Option<u64> {
    if text.is_empty() {
        return None;
    }
    text.iter().try_fold(0u64, |acc, &c| {
        let digit = char::from(c).to_digit(16)?;
        acc.checked_mul(16)?.checked_add(u64::from(digit))
    })
}

fn parse_mapping(line: &[u8]) -> Option<Mapping<'_>> {
    // start-end perms offset dev inode [path]
    let mut fields = line.splitn(6, |&b| b == b' ');
    let range = fields.next()?;
    let _perms = fields.next()?;
    let offset = parse_hex(fields.next()?)?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.next().unwrap_or_default();
    let start = path.iter().position(|&b| b != b' ').unwrap_or(path.len());
    let path = &path[start..];
    let dash = range.iter().position(|&b| b == b'-')?;
    Some(Mapping {
        start: parse_hex(&range[..dash])? as usize,
        end: parse_hex(&range[dash + 1..])? as usize,
        offset,
        path,
    })
}

/// Reads the ELF headers of the image mapped at `base`.
fn describe_image(base: usize, name: &[u8], image: &mut BinaryImage) -> bool {
    let mut magic = [0u8; 4];
    if !copy_safely(base, &mut magic) || magic != ELF_MAGIC {
        return false;
    }
    let Some(header) = read_value::<libc::Elf64_Ehdr>(base) else {
        return false;
    };
    image.address = base;
    image.name = FixedString::from_bytes_lossy(name);
    image.cpu_type = i64::from(header.e_machine);
    image.cpu_subtype = 0;
    image.uuid = [0; 16];
    image.vm_address = 0;

    let phdr_size = usize::from(header.e_phentsize).max(std::mem::size_of::<libc::Elf64_Phdr>());
    let phdrs = base + header.e_phoff as usize;
    let program_header = |i: usize| read_value::<libc::Elf64_Phdr>(phdrs + i * phdr_size);

    let mut lowest_load = None;
    let mut first_load = None;
    for i in 0..usize::from(header.e_phnum) {
        let Some(phdr) = program_header(i) else {
            break;
        };
        if phdr.p_type == PT_LOAD {
            lowest_load = Some(lowest_load.map_or(phdr.p_vaddr, |low: u64| low.min(phdr.p_vaddr)));
            if phdr.p_offset == 0 && first_load.is_none() {
                first_load = Some(phdr.p_vaddr);
            }
        }
    }
    image.vm_address = lowest_load.unwrap_or(0) as usize;
    // The mapping at offset 0 holds the segment whose file offset is 0.
    let page_mask = !(page_size::get() as u64 - 1);
    let load_bias = base.wrapping_sub((first_load.unwrap_or(0) & page_mask) as usize);

    for i in 0..usize::from(header.e_phnum) {
        let Some(phdr) = program_header(i) else {
            break;
        };
        if phdr.p_type == PT_NOTE {
            let notes = load_bias.wrapping_add(phdr.p_vaddr as usize);
            if let Some(build_id) = find_build_id(notes, (phdr.p_memsz as usize).min(MAX_NOTES_SIZE))
            {
                image.uuid = build_id;
                break;
            }
        }
    }
    true
}

/// First 16 bytes of the GNU build id in a note segment, zero-padded.
fn find_build_id(notes: usize, len: usize) -> Option<[u8; 16]> {
    let align4 = |n: usize| (n + 3) & !3;
    let header_size = std::mem::size_of::<NoteHeader>();
    let mut offset = 0;
    while offset + header_size <= len {
        let note = read_value::<NoteHeader>(notes + offset)?;
        let name_at = offset + header_size;
        let desc_at = name_at + align4(note.name_size as usize);
        let next = desc_at + align4(note.desc_size as usize);
        if note.kind == NT_GNU_BUILD_ID && note.name_size == 4 && next <= len {
            let mut name = [0u8; 4];
            if copy_safely(notes + name_at, &mut name) && &name == b"GNU\0" {
                let mut id = [0u8; 16];
                let n = (note.desc_size as usize).min(id.len());
                return copy_safely(notes + desc_at, &mut id[..n]).then_some(id);
            }
        }
        offset = next;
    }
    None
}

/// Calls `f` for every loaded image, in address order, until it breaks.
pub fn for_each_image(mut f: impl FnMut(&BinaryImage) -> ControlFlow<()>) {
    let Ok(file) = RawFile::open_read(c"/proc/self/maps") else {
        return;
    };
    let mut storage = [0u8; 4096];
    let mut reader = BufferedReader::new(file, &mut storage);
    let mut line = [0u8; MAX_PATH_LENGTH + 128];
    let mut current: Option<BinaryImage> = None;

    while let Some(bytes) = reader.read_until(b'\n', &mut line) {
        let Some(mapping) = parse_mapping(bytes) else {
            continue;
        };
        if let Some(image) = current.as_mut() {
            if mapping.offset != 0 && mapping.path == image.name.as_bytes() {
                image.size = mapping.end - image.address;
                continue;
            }
            let done = *image;
            current = None;
            if f(&done).is_break() {
                return;
            }
        }
        if mapping.offset == 0 && mapping.path.first() == Some(&b'/') {
            let mut image = BinaryImage {
                address: mapping.start,
                vm_address: 0,
                size: mapping.end - mapping.start,
                name: FixedString::new(),
                uuid: [0; 16],
                cpu_type: 0,
                cpu_subtype: 0,
                major_version: 0,
                minor_version: 0,
                revision_version: 0,
            };
            if describe_image(mapping.start, mapping.path, &mut image) {
                current = Some(image);
            }
        }
    }
    if let Some(image) = current {
        let _ = f(&image);
    }
}

/// Number of loaded images.
pub fn image_count() -> usize {
    let mut count = 0;
    for_each_image(|_| {
        count += 1;
        ControlFlow::Continue(())
    });
    count
}

/// Build id of the image loaded from `path`, if it has one.
pub fn image_uuid_for_path(path: &str) -> Option<[u8; 16]> {
    let mut uuid = None;
    for_each_image(|image| {
        if image.name.as_str() != path {
            return ControlFlow::Continue(());
        }
        uuid = (image.uuid != [0; 16]).then_some(image.uuid);
        ControlFlow::Break(())
    });
    uuid
}

/// The image containing `address`.
pub fn image_containing(address: usize) -> Option<BinaryImage> {
    let mut found = None;
    for_each_image(|image| {
        if (image.address..image.address + image.size).contains(&address) {
            found = Some(*image);
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    });
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mapping() {
        let line = b"7f2c4a000000-7f2c4a028000 r--p 00000000 fd:01 1234   /usr/lib/libc.so.6";
        let mapping = parse_mapping(line).unwrap();
        assert_eq!(mapping.start, 0x7f2c4a000000);
        assert_eq!(mapping.end, 0x7f2c4a028000);
        assert_eq!(mapping.offset, 0);
        assert_eq!(mapping.path, b"/usr/lib/libc.so.6");

        let anonymous = parse_mapping(b"7ffd1000-7ffd2000 rw-p 00000000 00:00 0").unwrap();
        assert!(anonymous.path.is_empty());
        assert!(parse_mapping(b"garbage").is_none());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_images_of_this_process() {
        let exe = std::env::current_exe().unwrap();
        let exe = exe.to_str().unwrap();
        let mut saw_exe = false;
        let mut last_address = 0;
        for_each_image(|image| {
            assert!(image.address > last_address, "images are in address order");
            last_address = image.address;
            assert!(image.size > 0);
            if image.name.as_str() == exe {
                saw_exe = true;
                assert_eq!(image.cpu_type, NATIVE_CPU_TYPE);
            }
            ControlFlow::Continue(())
        });
        assert!(saw_exe, "{exe} not found");
        assert!(image_count() > 1);

        let here = test_images_of_this_process as usize;
        let image = image_containing(here).unwrap();
        assert_eq!(image.name.as_str(), exe);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_build_id_of_libc() {
        // libc carries a build id on every mainstream distribution.
        let mut libc_uuid = None;
        for_each_image(|image| {
            if image.name.as_str().contains("libc.so") {
                libc_uuid = Some(image.uuid);
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });
        if let Some(uuid) = libc_uuid {
            assert_ne!(uuid, [0; 16]);
        }
    }
}
