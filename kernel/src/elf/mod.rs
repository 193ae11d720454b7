//! Loader for ET_DYN ELF binaries.
//!
//! The loader validates the headers against a deliberately narrow policy
//! (little-endian, the configured machine, no writable-executable segments,
//! non-executable stack, eager binding), maps every `PT_LOAD` through the
//! target address space, applies the dynamic relocations, seals
//! `PT_GNU_RELRO`, and, for a main executable naming an interpreter,
//! recursively loads the interpreter and reports its entry point.
//!
//! Two modes share the code path: userland (a target [`AddrSpace`] is
//! given) and kernel module (no space; segments are mapped eagerly into the
//! kernel heap, `DT_NEEDED` entries go to the caller's dependency handler
//! and undefined symbols resolve against the kernel symbol table or the
//! caller's resolver).
//!
//! All loader state lives in an [`ElfCtx`] that exists only for the
//! duration of the load.

use alloc::{string::String, sync::Arc, vec, vec::Vec};

use bitflags::bitflags;
use config::elf::{ELF_MACHINE, INTERP_PATH_MAX, KMOD_MAX_SIZE, LOAD_ALIGN_MAX};
use config::mm::{PAGE_MASK, PAGE_SIZE};
use elf::abi;
use mm::address::VirtAddr;
use systype::{
    memory_flags::{MapFlags, MemProt},
    SysError, SysResult,
};
use vfs::File;

use crate::{ksym, vm::AddrSpace, vm::KSPACE};

pub mod reloc;

use reloc::RelocKind;

// Program header types the policy ignores rather than rejects.
const PT_EXIDX: u32 = 0x7000_0001;
const PT_RISCV_ATTRIBUTES: u32 = 0x7000_0003;

// GNU extension tags tolerated in PT_DYNAMIC.
const DT_RELACOUNT: i64 = 0x6fff_fff9;
const DT_RELCOUNT: i64 = 0x6fff_fffa;

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const DYN_SIZE: usize = 16;
const SYM_SIZE: usize = 24;
const REL_SIZE: usize = 16;
const RELA_SIZE: usize = 24;

bitflags! {
    /// Load-mode flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ElfFlags: u32 {
        /// This load is itself the interpreter of another binary.
        const INTERP = 1 << 0;
        /// Kernel module mode: no target space, kernel-side linking.
        const KMOD = 1 << 1;
    }
}

/// Handler invoked for each `DT_NEEDED` entry of a kernel module.
pub type DepHandler<'a> = &'a mut dyn FnMut(&str) -> SysResult<()>;
/// Fallback resolver for undefined kernel module symbols.
pub type SymResolver<'a> = &'a dyn Fn(&str) -> Option<usize>;

/// What a completed load reports.
#[derive(Debug, Default, Clone, Copy)]
pub struct ElfInfo {
    /// Load bias: link-time address 0 landed here.
    pub base: usize,
    /// Lowest mapped address.
    pub map_base: usize,
    /// Span of the mapping in bytes.
    pub map_size: usize,
    /// Lowest link-time address of any `PT_LOAD`.
    pub min_addr: usize,
    /// Highest link-time address of any `PT_LOAD`.
    pub max_addr: usize,
    /// Runtime address of the program header table.
    pub phaddr: usize,
    /// Number of program headers.
    pub phnum: u16,
    /// Size of one program header entry.
    pub phent: u16,
    /// Where execution starts: the interpreter's entry when one is loaded,
    /// the binary's own entry otherwise.
    pub entry: usize,
    /// The binary's own entry, independent of interpreter chaining.
    pub real_entry: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Ehdr {
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[derive(Debug, Clone, Copy, Default)]
struct Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(bytes)
}

fn read_i64(buf: &[u8], off: usize) -> i64 {
    read_u64(buf, off) as i64
}

fn prot_from_phdr(flags: u32) -> MemProt {
    let mut prot = MemProt::empty();
    if flags & abi::PF_X != 0 {
        prot |= MemProt::X;
    }
    if flags & abi::PF_W != 0 {
        prot |= MemProt::W;
    }
    if flags & abi::PF_R != 0 {
        prot |= MemProt::R;
    }
    prot
}

/// Window cache over the symbol table, so each lookup does not re-read the
/// target space.
#[derive(Default)]
struct SymCache {
    offset: u64,
    data: Vec<u8>,
}

struct ElfCtx<'a, 'b> {
    space: Option<&'a Arc<AddrSpace>>,
    file: &'a Arc<dyn File>,
    flags: ElfFlags,
    ehdr: Ehdr,
    phdrs: Vec<Phdr>,
    base: usize,
    map_base: usize,
    map_size: usize,
    min_addr: usize,
    max_addr: usize,
    addr_align: usize,
    pt_dynamic: Option<usize>,
    pt_interp: Option<usize>,
    pt_gnu_stack: Option<usize>,
    pt_gnu_relro: Option<usize>,
    pt_tls: Option<usize>,
    pt_phdr: Option<usize>,
    dt_strtab: u64,
    dt_strsz: u64,
    dt_symtab: u64,
    dt_syment: u64,
    sym_cache: SymCache,
    /// Kernel span reserved for a module, released if the load fails.
    kmod_span: Option<(usize, usize)>,
    dep_handler: Option<DepHandler<'b>>,
    sym_resolver: Option<SymResolver<'b>>,
}

/// Loads the ET_DYN binary in `file`.
///
/// With a target `space` the binary is mapped lazily as file-backed and
/// anonymous zones; without one it is linked into the kernel heap as a
/// module (`ElfFlags::KMOD`).
///
/// # Errors
/// `ENOEXEC` for anything malformed or rejected by policy, `ENOMEM` when
/// space cannot be found, errors of the dependency handler as they are.
pub fn load<'a, 'b>(
    file: &'a Arc<dyn File>,
    space: Option<&'a Arc<AddrSpace>>,
    flags: ElfFlags,
    dep_handler: Option<DepHandler<'b>>,
    sym_resolver: Option<SymResolver<'b>>,
) -> SysResult<ElfInfo> {
    let mut ctx = ElfCtx {
        space,
        file,
        flags,
        ehdr: Ehdr::default(),
        phdrs: Vec::new(),
        base: 0,
        map_base: 0,
        map_size: 0,
        min_addr: 0,
        max_addr: 0,
        addr_align: PAGE_SIZE,
        pt_dynamic: None,
        pt_interp: None,
        pt_gnu_stack: None,
        pt_gnu_relro: None,
        pt_tls: None,
        pt_phdr: None,
        dt_strtab: 0,
        dt_strsz: 0,
        dt_symtab: 0,
        dt_syment: 0,
        sym_cache: SymCache::default(),
        kmod_span: None,
        dep_handler,
        sym_resolver,
    };
    let result = load_inner(&mut ctx);
    if result.is_err() {
        if let Some((addr, size)) = ctx.kmod_span.take() {
            KSPACE.free_span(addr, size).expect("span was reserved");
        }
    }
    result
}

fn load_inner(ctx: &mut ElfCtx<'_, '_>) -> SysResult<ElfInfo> {
    load_ehdr(ctx)?;
    load_phdrs(ctx)?;
    if ctx.space.is_some() {
        map_user(ctx)?;
    } else {
        map_kern(ctx)?;
    }

    let mut info = ElfInfo::default();
    if ctx.pt_interp.is_some() {
        let interp_info = handle_interp(ctx)?;
        info.entry = interp_info.entry;
    } else {
        handle_pt_dynamic(ctx)?;
        handle_pt_gnu_relro(ctx)?;
        info.entry = ctx.base.wrapping_add(ctx.ehdr.e_entry as usize);
    }

    info.base = ctx.base;
    info.map_base = ctx.map_base;
    info.map_size = ctx.map_size;
    info.min_addr = ctx.min_addr;
    info.max_addr = ctx.max_addr;
    info.phaddr = match ctx.pt_phdr {
        Some(i) => ctx.base.wrapping_add(ctx.phdrs[i].p_vaddr as usize),
        None => ctx.base.wrapping_add(ctx.ehdr.e_phoff as usize),
    };
    info.phnum = ctx.ehdr.e_phnum;
    info.phent = ctx.ehdr.e_phentsize;
    info.real_entry = ctx.base.wrapping_add(ctx.ehdr.e_entry as usize);
    // A loaded module stays resident; its span is no longer ours to free.
    ctx.kmod_span = None;
    Ok(info)
}

/// Reads exactly `buf.len()` bytes at `off`; a short read means a
/// truncated binary.
fn readseq_exact(file: &Arc<dyn File>, off: usize, buf: &mut [u8]) -> SysResult<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = file.read_at(off + done, &mut buf[done..])?;
        if n == 0 {
            log::trace!("elf: file too short at offset {}", off + done);
            return Err(SysError::ENOEXEC);
        }
        done += n;
    }
    Ok(())
}

fn load_ehdr(ctx: &mut ElfCtx<'_, '_>) -> SysResult<()> {
    let mut buf = [0u8; EHDR_SIZE];
    readseq_exact(ctx.file, 0, &mut buf)?;
    if buf[..4] != [0x7F, b'E', b'L', b'F'] {
        log::trace!("elf: invalid header magic");
        return Err(SysError::ENOEXEC);
    }
    if buf[abi::EI_CLASS as usize] != abi::ELFCLASS64 as u8 {
        log::trace!("elf: invalid header class");
        return Err(SysError::ENOEXEC);
    }
    if buf[abi::EI_DATA as usize] != abi::ELFDATA2LSB as u8 {
        log::trace!("elf: invalid header data encoding");
        return Err(SysError::ENOEXEC);
    }
    if buf[abi::EI_VERSION as usize] != abi::EV_CURRENT as u8 {
        log::trace!("elf: invalid header version");
        return Err(SysError::ENOEXEC);
    }
    let ehdr = Ehdr {
        e_type: read_u16(&buf, 16),
        e_machine: read_u16(&buf, 18),
        e_version: read_u32(&buf, 20),
        e_entry: read_u64(&buf, 24),
        e_phoff: read_u64(&buf, 32),
        e_phentsize: read_u16(&buf, 54),
        e_phnum: read_u16(&buf, 56),
        e_shentsize: read_u16(&buf, 58),
        e_shnum: read_u16(&buf, 60),
        e_shstrndx: read_u16(&buf, 62),
    };
    if ehdr.e_type != abi::ET_DYN {
        log::trace!("elf: not a dynamic binary");
        return Err(SysError::ENOEXEC);
    }
    if ehdr.e_machine != ELF_MACHINE {
        log::trace!("elf: invalid header machine {:#x}", ehdr.e_machine);
        return Err(SysError::ENOEXEC);
    }
    if ehdr.e_version != abi::EV_CURRENT as u32 {
        log::trace!("elf: invalid header version field");
        return Err(SysError::ENOEXEC);
    }
    if ehdr.e_shentsize as usize != SHDR_SIZE {
        log::trace!("elf: invalid section entry size");
        return Err(SysError::ENOEXEC);
    }
    if ehdr.e_phentsize as usize != PHDR_SIZE {
        log::trace!("elf: invalid program entry size");
        return Err(SysError::ENOEXEC);
    }
    if ehdr.e_shstrndx >= ehdr.e_shnum {
        log::trace!("elf: invalid shstrtab position");
        return Err(SysError::ENOEXEC);
    }
    ctx.ehdr = ehdr;
    Ok(())
}

fn load_phdrs(ctx: &mut ElfCtx<'_, '_>) -> SysResult<()> {
    let count = ctx.ehdr.e_phnum as usize;
    let mut table = vec![0u8; count * PHDR_SIZE];
    readseq_exact(ctx.file, ctx.ehdr.e_phoff as usize, &mut table)?;
    let mut phdrs = Vec::with_capacity(count);
    for i in 0..count {
        let entry = &table[i * PHDR_SIZE..(i + 1) * PHDR_SIZE];
        phdrs.push(Phdr {
            p_type: read_u32(entry, 0),
            p_flags: read_u32(entry, 4),
            p_offset: read_u64(entry, 8),
            p_vaddr: read_u64(entry, 16),
            p_filesz: read_u64(entry, 32),
            p_memsz: read_u64(entry, 40),
            p_align: read_u64(entry, 48),
        });
    }

    fn record(slot: &mut Option<usize>, index: usize, what: &str) -> SysResult<()> {
        if slot.is_some() {
            log::trace!("elf: multiple {}", what);
            return Err(SysError::ENOEXEC);
        }
        *slot = Some(index);
        Ok(())
    }

    for (i, phdr) in phdrs.iter().enumerate() {
        match phdr.p_type {
            abi::PT_INTERP => record(&mut ctx.pt_interp, i, "PT_INTERP")?,
            abi::PT_GNU_STACK => {
                if phdr.p_flags != abi::PF_R | abi::PF_W {
                    log::trace!("elf: invalid PT_GNU_STACK protection");
                    return Err(SysError::ENOEXEC);
                }
                record(&mut ctx.pt_gnu_stack, i, "PT_GNU_STACK")?;
            }
            abi::PT_GNU_RELRO => record(&mut ctx.pt_gnu_relro, i, "PT_GNU_RELRO")?,
            abi::PT_LOAD => {
                if phdr.p_filesz > phdr.p_memsz {
                    log::trace!("elf: p_filesz > p_memsz");
                    return Err(SysError::ENOEXEC);
                }
                if phdr.p_flags & (abi::PF_W | abi::PF_X) == abi::PF_W | abi::PF_X {
                    log::trace!("elf: PT_LOAD is writable and executable");
                    return Err(SysError::ENOEXEC);
                }
                if phdr.p_align == 0 || phdr.p_align > LOAD_ALIGN_MAX {
                    log::trace!("elf: PT_LOAD has invalid alignment");
                    return Err(SysError::ENOEXEC);
                }
                if phdr.p_align as usize > ctx.addr_align {
                    ctx.addr_align = phdr.p_align as usize;
                }
            }
            abi::PT_DYNAMIC => record(&mut ctx.pt_dynamic, i, "PT_DYNAMIC")?,
            abi::PT_TLS => record(&mut ctx.pt_tls, i, "PT_TLS")?,
            abi::PT_PHDR => record(&mut ctx.pt_phdr, i, "PT_PHDR")?,
            PT_EXIDX | PT_RISCV_ATTRIBUTES => {}
            other => {
                log::trace!("elf: unknown phdr type {:#x}", other);
                return Err(SysError::ENOEXEC);
            }
        }
    }
    if ctx.pt_gnu_stack.is_none() {
        log::trace!("elf: no PT_GNU_STACK");
        return Err(SysError::ENOEXEC);
    }
    if ctx.pt_gnu_relro.is_none() {
        log::trace!("elf: no PT_GNU_RELRO");
        return Err(SysError::ENOEXEC);
    }
    if ctx.pt_dynamic.is_none() {
        log::trace!("elf: no PT_DYNAMIC");
        return Err(SysError::ENOEXEC);
    }
    if ctx.pt_phdr.is_none() && !ctx.flags.intersects(ElfFlags::INTERP | ElfFlags::KMOD) {
        log::trace!("elf: no PT_PHDR");
        return Err(SysError::ENOEXEC);
    }
    if ctx.pt_tls.is_some() && ctx.pt_interp.is_none() {
        log::trace!("elf: PT_TLS without an interpreter");
        return Err(SysError::ENOEXEC);
    }
    if ctx.pt_interp.is_some() && ctx.flags.contains(ElfFlags::INTERP) {
        log::trace!("elf: nested interpreter");
        return Err(SysError::ENOEXEC);
    }
    if ctx.pt_interp.is_some() && ctx.flags.contains(ElfFlags::KMOD) {
        log::trace!("elf: interpreter in a kernel module");
        return Err(SysError::ENOEXEC);
    }
    ctx.phdrs = phdrs;
    Ok(())
}

/// Derives the page-rounded link-time address range covered by `PT_LOAD`.
fn get_min_max_addr(ctx: &mut ElfCtx<'_, '_>) -> SysResult<()> {
    let mut min_addr = usize::MAX;
    let mut max_addr = 0usize;
    for phdr in ctx.phdrs.iter().filter(|p| p.p_type == abi::PT_LOAD) {
        let align = (phdr.p_align as usize).max(PAGE_SIZE);
        let vaddr = phdr.p_vaddr as usize;
        let lo = vaddr - vaddr % align;
        let span = phdr.p_memsz as usize + (vaddr - lo);
        let span = span + (align - span % align) % align;
        min_addr = min_addr.min(lo);
        max_addr = max_addr.max(lo + span);
    }
    if min_addr >= max_addr {
        log::trace!("elf: no loadable range");
        return Err(SysError::ENOEXEC);
    }
    ctx.min_addr = min_addr;
    ctx.max_addr = max_addr;
    ctx.map_size = max_addr - min_addr;
    Ok(())
}

fn align_base_up(base: usize, align: usize) -> usize {
    let base = base.wrapping_add(align - 1);
    base - base % align
}

fn map_user(ctx: &mut ElfCtx<'_, '_>) -> SysResult<()> {
    get_min_max_addr(ctx)?;
    let space = ctx.space.unwrap();
    if ctx.flags.contains(ElfFlags::INTERP) {
        // Probe for a free span: reserve, note the address, release. The
        // actual zones land there a moment later under the same spot.
        let probe = space.alloc(
            None,
            0,
            ctx.map_size,
            MemProt::RW,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS,
            None,
        )?;
        space.free(probe, ctx.map_size)?;
        ctx.base = probe.to_usize().wrapping_sub(ctx.min_addr);
    } else {
        ctx.base = space.user_range().0.wrapping_sub(ctx.min_addr);
    }
    ctx.base = align_base_up(ctx.base, ctx.addr_align);
    ctx.map_base = ctx.base.wrapping_add(ctx.min_addr);
    for i in 0..ctx.phdrs.len() {
        let phdr = ctx.phdrs[i];
        if phdr.p_type != abi::PT_LOAD {
            continue;
        }
        handle_pt_load_user(ctx, &phdr)?;
    }
    Ok(())
}

fn handle_pt_load_user(ctx: &mut ElfCtx<'_, '_>, phdr: &Phdr) -> SysResult<()> {
    let space = ctx.space.unwrap();
    let vaddr = ctx.base.wrapping_add(phdr.p_vaddr as usize);
    let valign = vaddr & PAGE_MASK;
    let vaddr = vaddr - valign;
    let mut fsize = phdr.p_filesz as usize + valign;
    let fsize_pad = (PAGE_SIZE - fsize % PAGE_SIZE) % PAGE_SIZE;
    fsize += fsize_pad;
    let vsize = (phdr.p_memsz as usize + valign + PAGE_SIZE - 1) & !PAGE_MASK;
    let poffset = phdr.p_offset as usize;
    let poffset_align = poffset & PAGE_MASK;
    let poffset = poffset - poffset_align;
    if poffset_align != valign {
        log::trace!("elf: PT_LOAD offset misaligned against its vaddr");
        return Err(SysError::EINVAL);
    }
    let prot = prot_from_phdr(phdr.p_flags);
    if fsize > 0 {
        ctx.file.mmap()?;
        space.alloc(
            Some(VirtAddr::new(vaddr)),
            poffset,
            fsize,
            prot,
            MapFlags::PRIVATE,
            Some(Arc::clone(ctx.file)),
        )?;
        if fsize_pad > 0 {
            // The mapping's final page carries bytes past p_filesz; they
            // must read as zero.
            let zeros = vec![0u8; fsize_pad];
            if let Err(e) = space.write_through(VirtAddr::new(vaddr + fsize - fsize_pad), &zeros) {
                space.free(VirtAddr::new(vaddr), fsize).ok();
                return Err(e);
            }
        }
    }
    if vsize > fsize {
        let anon = space.alloc(
            Some(VirtAddr::new(vaddr + fsize)),
            0,
            vsize - fsize,
            prot,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS,
            None,
        );
        if let Err(e) = anon {
            if fsize > 0 {
                space.free(VirtAddr::new(vaddr), fsize).ok();
            }
            return Err(e);
        }
    }
    Ok(())
}

fn map_kern(ctx: &mut ElfCtx<'_, '_>) -> SysResult<()> {
    get_min_max_addr(ctx)?;
    if ctx.map_size > KMOD_MAX_SIZE {
        log::trace!("elf: kernel module too big ({:#x} bytes)", ctx.map_size);
        return Err(SysError::ENOEXEC);
    }
    let span = ctx.map_size + ctx.addr_align;
    let map_base = KSPACE.alloc_span(span)?;
    ctx.kmod_span = Some((map_base, span));
    ctx.map_base = map_base;
    ctx.base = align_base_up(map_base.wrapping_sub(ctx.min_addr), ctx.addr_align);
    for i in 0..ctx.phdrs.len() {
        let phdr = ctx.phdrs[i];
        if phdr.p_type != abi::PT_LOAD {
            continue;
        }
        handle_pt_load_kern(ctx, &phdr)?;
    }
    Ok(())
}

fn handle_pt_load_kern(ctx: &mut ElfCtx<'_, '_>, phdr: &Phdr) -> SysResult<()> {
    let vaddr = ctx.base.wrapping_add(phdr.p_vaddr as usize);
    let valign = vaddr & PAGE_MASK;
    let vaddr = vaddr - valign;
    let vsize = (phdr.p_memsz as usize + valign + PAGE_SIZE - 1) & !PAGE_MASK;
    for off in (0..vsize).step_by(PAGE_SIZE) {
        let frame = mm::frame::Frame::build()?;
        KSPACE.map_frame(vaddr + off, Arc::new(frame), MemProt::RW)?;
    }
    // Stream the file contents in; frames are zeroed, so the bss tail needs
    // no extra pass.
    let mut remaining = phdr.p_filesz as usize;
    let mut file_off = phdr.p_offset as usize;
    let mut dst = vaddr + valign;
    let mut buf = [0u8; PAGE_SIZE];
    while remaining > 0 {
        let chunk = remaining.min(PAGE_SIZE);
        readseq_exact(ctx.file, file_off, &mut buf[..chunk])?;
        KSPACE.write(dst, &buf[..chunk])?;
        remaining -= chunk;
        file_off += chunk;
        dst += chunk;
    }
    KSPACE.protect(vaddr, vsize, prot_from_phdr(phdr.p_flags))
}

impl ElfCtx<'_, '_> {
    /// Reads from the mapped image at link-time offset `offset`.
    fn read_target(&self, offset: u64, buf: &mut [u8]) -> SysResult<()> {
        let offset = offset as usize;
        if buf.is_empty()
            || offset < self.min_addr
            || offset.checked_add(buf.len()).map_or(true, |end| end > self.max_addr)
        {
            return Err(SysError::EINVAL);
        }
        let addr = self.base.wrapping_add(offset);
        match self.space {
            Some(space) => space.copy_in(VirtAddr::new(addr), buf),
            None => KSPACE.read(addr, buf),
        }
    }

    /// Writes into the mapped image at link-time offset `offset`,
    /// regardless of segment protection.
    fn write_target(&self, offset: u64, buf: &[u8]) -> SysResult<()> {
        let offset = offset as usize;
        if buf.is_empty()
            || offset < self.min_addr
            || offset.checked_add(buf.len()).map_or(true, |end| end > self.max_addr)
        {
            return Err(SysError::EINVAL);
        }
        let addr = self.base.wrapping_add(offset);
        match self.space {
            Some(space) => space.write_through(VirtAddr::new(addr), buf),
            None => KSPACE.write(addr, buf),
        }
    }

    /// Reads a NUL-terminated name out of the dynamic string table.
    fn read_strtab(&self, name_off: u64) -> SysResult<String> {
        if name_off >= self.dt_strsz {
            log::trace!("elf: name out of string table bounds");
            return Err(SysError::EINVAL);
        }
        let max_len = (self.dt_strsz - name_off) as usize;
        let mut bytes = vec![0u8; max_len.min(INTERP_PATH_MAX)];
        self.read_target(self.dt_strtab + name_off, &mut bytes)?;
        let len = bytes.iter().position(|&b| b == 0).ok_or(SysError::EINVAL)?;
        bytes.truncate(len);
        String::from_utf8(bytes).map_err(|_| SysError::EINVAL)
    }

    /// Resolves symbol `symidx` to its link-time value.
    fn get_sym(&mut self, symidx: u64) -> SysResult<u64> {
        let mut cache = core::mem::take(&mut self.sym_cache);
        let result = self.get_sym_cached(&mut cache, symidx);
        self.sym_cache = cache;
        result
    }

    fn get_sym_cached(&self, cache: &mut SymCache, symidx: u64) -> SysResult<u64> {
        let sym_off = self.dt_symtab + symidx * self.dt_syment;
        let window_hit = sym_off >= cache.offset
            && sym_off + SYM_SIZE as u64 <= cache.offset + cache.data.len() as u64;
        if !window_hit {
            let mut window = vec![0u8; SYM_SIZE * 32];
            // Clamp the window to the mapped range.
            let room = (self.max_addr as u64).saturating_sub(sym_off) as usize;
            window.truncate(room.max(SYM_SIZE).min(window.len()));
            self.read_target(sym_off, &mut window)?;
            cache.offset = sym_off;
            cache.data = window;
        }
        let entry = &cache.data[(sym_off - cache.offset) as usize..];
        let st_name = read_u32(entry, 0);
        let st_shndx = read_u16(entry, 6);
        let st_value = read_u64(entry, 8);
        if st_shndx != abi::SHN_UNDEF {
            return Ok(st_value);
        }
        if self.space.is_some() {
            log::trace!("elf: undefined symbol in userland binary");
            return Err(SysError::EINVAL);
        }
        let name = self.read_strtab(st_name as u64)?;
        if let Some(addr) = ksym::lookup(&name) {
            return Ok(addr.wrapping_sub(self.base) as u64);
        }
        if let Some(resolver) = self.sym_resolver {
            if let Some(addr) = resolver(&name) {
                return Ok(addr.wrapping_sub(self.base) as u64);
            }
        }
        log::trace!("elf: symbol {} not found", name);
        Err(SysError::EINVAL)
    }

    fn apply_relocation(
        &mut self,
        r_offset: u64,
        rtype: u32,
        symidx: u64,
        addend: u64,
    ) -> SysResult<()> {
        let kind = match reloc::classify(self.ehdr.e_machine, rtype) {
            Some(kind) => kind,
            None => {
                log::trace!("elf: unhandled relocation type {:#x}", rtype);
                return Err(SysError::ENOEXEC);
            }
        };
        let base = self.base as u64;
        match kind {
            RelocKind::None => Ok(()),
            RelocKind::Relative => {
                self.write_target(r_offset, &base.wrapping_add(addend).to_le_bytes())
            }
            RelocKind::JmpSlot | RelocKind::GlobDat => {
                let sym = self.get_sym(symidx)?;
                self.write_target(r_offset, &base.wrapping_add(sym).to_le_bytes())
            }
            RelocKind::Abs64 => {
                let sym = self.get_sym(symidx)?;
                self.write_target(
                    r_offset,
                    &base.wrapping_add(sym).wrapping_add(addend).to_le_bytes(),
                )
            }
            RelocKind::Abs32 => {
                let sym = self.get_sym(symidx)?;
                let value = base.wrapping_add(sym).wrapping_add(addend) as u32;
                self.write_target(r_offset, &value.to_le_bytes())
            }
            RelocKind::Pc32 => {
                let sym = self.get_sym(symidx)?;
                let value = sym.wrapping_sub(r_offset).wrapping_add(addend) as u32;
                self.write_target(r_offset, &value.to_le_bytes())
            }
        }
    }

    /// Walks one relocation table, explicit-addend or implicit.
    fn apply_rel_table(
        &mut self,
        table: u64,
        size: u64,
        ent: u64,
        explicit_addend: bool,
    ) -> SysResult<()> {
        let min_ent = if explicit_addend { RELA_SIZE } else { REL_SIZE } as u64;
        if ent < min_ent {
            log::trace!("elf: undersized relocation entry");
            return Err(SysError::ENOEXEC);
        }
        let mut bytes = vec![0u8; size as usize];
        self.read_target(table, &mut bytes)?;
        let mut off = 0usize;
        while off + min_ent as usize <= bytes.len() {
            let r_offset = read_u64(&bytes, off);
            let r_info = read_u64(&bytes, off + 8);
            let rtype = (r_info & 0xFFFF_FFFF) as u32;
            let symidx = r_info >> 32;
            let addend = if explicit_addend {
                read_i64(&bytes, off + 16) as u64
            } else {
                let mut implicit = [0u8; 8];
                self.read_target(r_offset, &mut implicit)?;
                u64::from_le_bytes(implicit)
            };
            self.apply_relocation(r_offset, rtype, symidx, addend)?;
            off += ent as usize;
        }
        Ok(())
    }
}

fn handle_pt_dynamic(ctx: &mut ElfCtx<'_, '_>) -> SysResult<()> {
    let dynamic = ctx.phdrs[ctx.pt_dynamic.unwrap()];
    if dynamic.p_memsz != dynamic.p_filesz {
        log::trace!("elf: PT_DYNAMIC filesz != memsz");
        return Err(SysError::ENOEXEC);
    }
    let mut table = vec![0u8; dynamic.p_memsz as usize];
    ctx.read_target(dynamic.p_vaddr, &mut table)?;

    struct Once(Option<u64>, &'static str);
    impl Once {
        fn set(&mut self, value: u64) -> SysResult<()> {
            if self.0.is_some() {
                log::trace!("elf: multiple {}", self.1);
                return Err(SysError::ENOEXEC);
            }
            self.0 = Some(value);
            Ok(())
        }
    }

    let mut dt_strtab = Once(None, "DT_STRTAB");
    let mut dt_strsz = Once(None, "DT_STRSZ");
    let mut dt_symtab = Once(None, "DT_SYMTAB");
    let mut dt_syment = Once(None, "DT_SYMENT");
    let mut dt_rel = Once(None, "DT_REL");
    let mut dt_relsz = Once(None, "DT_RELSZ");
    let mut dt_relent = Once(None, "DT_RELENT");
    let mut dt_rela = Once(None, "DT_RELA");
    let mut dt_relasz = Once(None, "DT_RELASZ");
    let mut dt_relaent = Once(None, "DT_RELAENT");
    let mut dt_jmprel = Once(None, "DT_JMPREL");
    let mut dt_pltrel = Once(None, "DT_PLTREL");
    let mut dt_pltrelsz = Once(None, "DT_PLTRELSZ");
    let mut dt_hash = Once(None, "DT_HASH");
    let mut dt_bind_now = Once(None, "DT_BIND_NOW");
    let mut dt_flags_1 = Once(None, "DT_FLAGS_1");
    let mut needed: Vec<u64> = Vec::new();

    let mut off = 0usize;
    while off + DYN_SIZE <= table.len() {
        let d_tag = read_i64(&table, off);
        let d_val = read_u64(&table, off + 8);
        off += DYN_SIZE;
        if d_tag == abi::DT_NULL {
            break;
        }
        match d_tag {
            abi::DT_STRTAB => dt_strtab.set(d_val)?,
            abi::DT_STRSZ => dt_strsz.set(d_val)?,
            abi::DT_SYMTAB => dt_symtab.set(d_val)?,
            abi::DT_SYMENT => dt_syment.set(d_val)?,
            abi::DT_REL => dt_rel.set(d_val)?,
            abi::DT_RELSZ => dt_relsz.set(d_val)?,
            abi::DT_RELENT => dt_relent.set(d_val)?,
            abi::DT_RELA => dt_rela.set(d_val)?,
            abi::DT_RELASZ => dt_relasz.set(d_val)?,
            abi::DT_RELAENT => dt_relaent.set(d_val)?,
            abi::DT_JMPREL => dt_jmprel.set(d_val)?,
            abi::DT_PLTREL => dt_pltrel.set(d_val)?,
            abi::DT_PLTRELSZ => dt_pltrelsz.set(d_val)?,
            abi::DT_HASH => dt_hash.set(d_val)?,
            abi::DT_BIND_NOW => dt_bind_now.set(d_val)?,
            abi::DT_FLAGS_1 => dt_flags_1.set(d_val)?,
            abi::DT_NEEDED => {
                if ctx.flags.contains(ElfFlags::INTERP) {
                    log::trace!("elf: DT_NEEDED in interpreter");
                    return Err(SysError::ENOEXEC);
                }
                needed.push(d_val);
            }
            abi::DT_GNU_HASH
            | abi::DT_DEBUG
            | abi::DT_TEXTREL
            | abi::DT_FLAGS
            | DT_RELCOUNT
            | abi::DT_PLTGOT
            | DT_RELACOUNT
            | abi::DT_SONAME
            | abi::DT_VERSYM
            | abi::DT_VERDEF
            | abi::DT_VERDEFNUM
            | abi::DT_VERNEED
            | abi::DT_VERNEEDNUM => {}
            other => {
                log::trace!("elf: unhandled dynamic tag {:#x}", other);
                return Err(SysError::ENOEXEC);
            }
        }
    }

    let require = |slot: &Once| -> SysResult<u64> {
        match slot.0 {
            Some(value) => Ok(value),
            None => {
                log::trace!("elf: no {}", slot.1);
                Err(SysError::ENOEXEC)
            }
        }
    };
    ctx.dt_strtab = require(&dt_strtab)?;
    ctx.dt_strsz = require(&dt_strsz)?;
    ctx.dt_symtab = require(&dt_symtab)?;
    ctx.dt_syment = require(&dt_syment)?;
    require(&dt_hash)?;
    require(&dt_bind_now)?;
    let flags_1 = require(&dt_flags_1)?;
    if flags_1 & abi::DF_1_NOW as u64 == 0 {
        log::trace!("elf: no DF_1_NOW");
        return Err(SysError::ENOEXEC);
    }
    let pie = flags_1 & abi::DF_1_PIE as u64 != 0;
    if ctx.flags.contains(ElfFlags::INTERP) || ctx.space.is_none() {
        if pie {
            log::trace!("elf: unexpected DF_1_PIE");
            return Err(SysError::ENOEXEC);
        }
    } else if !pie {
        log::trace!("elf: no DF_1_PIE");
        return Err(SysError::ENOEXEC);
    }

    if ctx.flags.contains(ElfFlags::KMOD) {
        for name_off in needed {
            let name = ctx.read_strtab(name_off)?;
            match ctx.dep_handler.as_mut() {
                Some(handler) => handler(&name)?,
                None => {
                    log::trace!("elf: DT_NEEDED {} without a handler", name);
                    return Err(SysError::EINVAL);
                }
            }
        }
    }

    if let Some(rel) = dt_rel.0 {
        let (Some(size), Some(ent)) = (dt_relsz.0, dt_relent.0) else {
            log::trace!("elf: DT_REL without DT_RELSZ or DT_RELENT");
            return Err(SysError::ENOEXEC);
        };
        ctx.apply_rel_table(rel, size, ent, false)?;
    }
    if let Some(rela) = dt_rela.0 {
        let (Some(size), Some(ent)) = (dt_relasz.0, dt_relaent.0) else {
            log::trace!("elf: DT_RELA without DT_RELASZ or DT_RELAENT");
            return Err(SysError::ENOEXEC);
        };
        ctx.apply_rel_table(rela, size, ent, true)?;
    }
    if let Some(jmprel) = dt_jmprel.0 {
        let (Some(pltrel), Some(size)) = (dt_pltrel.0, dt_pltrelsz.0) else {
            log::trace!("elf: DT_JMPREL without DT_PLTREL or DT_PLTRELSZ");
            return Err(SysError::ENOEXEC);
        };
        match pltrel as i64 {
            abi::DT_REL => ctx.apply_rel_table(jmprel, size, REL_SIZE as u64, false)?,
            abi::DT_RELA => ctx.apply_rel_table(jmprel, size, RELA_SIZE as u64, true)?,
            other => {
                log::trace!("elf: invalid DT_PLTREL {:#x}", other);
                return Err(SysError::ENOEXEC);
            }
        }
    }
    Ok(())
}

fn handle_pt_gnu_relro(ctx: &mut ElfCtx<'_, '_>) -> SysResult<()> {
    let relro = ctx.phdrs[ctx.pt_gnu_relro.unwrap()];
    let vaddr = relro.p_vaddr as usize;
    let vaddr_align = vaddr & PAGE_MASK;
    let vaddr = vaddr - vaddr_align;
    let vsize = (relro.p_memsz as usize + vaddr_align + PAGE_SIZE - 1) & !PAGE_MASK;
    let addr = ctx.base.wrapping_add(vaddr);
    match ctx.space {
        Some(space) => space.protect(VirtAddr::new(addr), vsize, MemProt::R),
        None => KSPACE.protect(addr, vsize, MemProt::R),
    }
}

fn handle_interp(ctx: &mut ElfCtx<'_, '_>) -> SysResult<ElfInfo> {
    if ctx.flags.contains(ElfFlags::INTERP) || ctx.flags.contains(ElfFlags::KMOD) {
        log::trace!("elf: interpreter not allowed here");
        return Err(SysError::ENOEXEC);
    }
    let interp = ctx.phdrs[ctx.pt_interp.unwrap()];
    let len = interp.p_filesz as usize;
    if len == 0 || len >= INTERP_PATH_MAX {
        log::trace!("elf: bad PT_INTERP size {}", len);
        return Err(SysError::ENOEXEC);
    }
    let mut path = vec![0u8; len];
    readseq_exact(ctx.file, interp.p_offset as usize, &mut path)?;
    // The path is usually NUL-terminated inside the segment.
    let end = path.iter().position(|&b| b == 0).unwrap_or(len);
    let path = core::str::from_utf8(&path[..end]).map_err(|_| SysError::ENOEXEC)?;
    log::debug!("elf: loading interpreter {}", path);
    let interp_file = vfs::open(path)?;
    load(
        &interp_file,
        ctx.space,
        ctx.flags | ElfFlags::INTERP,
        ctx.dep_handler.take(),
        ctx.sym_resolver,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::AddrSpace;
    use alloc::string::ToString;
    use vfs::RamFile;

    // Link-time layout of the synthetic image.
    const TEXT_VADDR: u64 = 0x1000;
    const DATA_VADDR: u64 = 0x2000;
    const DYN_VADDR: u64 = 0x2000;
    const RELA_VADDR: u64 = 0x2400;
    const GOT_VADDR: u64 = 0x2600;
    const SYMTAB_VADDR: u64 = 0x2800;
    const HASH_VADDR: u64 = 0x2900;
    const STRTAB_VADDR: u64 = 0x2A00;
    const INTERP_OFF: u64 = 0x2F00;
    const STRTAB: &[u8] = b"\0ext_func\0libdep.so\0";

    const R_RISCV_RELATIVE: u32 = 3;
    const R_RISCV_JUMP_SLOT: u32 = 5;

    struct ImageLayout {
        stack_flags: u32,
        text_flags: u32,
        flags_1: u64,
        interp: Option<&'static str>,
        with_relro: bool,
        with_tls: bool,
        extra_dynamic: Vec<(i64, u64)>,
        relas: Vec<(u64, u32, u64, i64)>,
        needed: Vec<u64>,
        machine: u16,
    }

    impl Default for ImageLayout {
        fn default() -> Self {
            Self {
                stack_flags: abi::PF_R | abi::PF_W,
                text_flags: abi::PF_R | abi::PF_X,
                flags_1: (abi::DF_1_NOW | abi::DF_1_PIE) as u64,
                interp: None,
                with_relro: true,
                with_tls: false,
                extra_dynamic: Vec::new(),
                relas: Vec::new(),
                needed: Vec::new(),
                machine: ELF_MACHINE,
            }
        }
    }

    fn push_u16(buf: &mut Vec<u8>, v: u16) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    fn push_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    fn push_u64(buf: &mut Vec<u8>, v: u64) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    fn push_phdr(
        buf: &mut Vec<u8>,
        p_type: u32,
        p_flags: u32,
        p_offset: u64,
        p_vaddr: u64,
        p_filesz: u64,
        p_memsz: u64,
        p_align: u64,
    ) {
        push_u32(buf, p_type);
        push_u32(buf, p_flags);
        push_u64(buf, p_offset);
        push_u64(buf, p_vaddr);
        push_u64(buf, p_vaddr);
        push_u64(buf, p_filesz);
        push_u64(buf, p_memsz);
        push_u64(buf, p_align);
    }

    /// Builds a minimal valid ET_DYN image per `layout`.
    fn build_image(layout: &ImageLayout) -> Vec<u8> {
        let mut dynamic: Vec<(i64, u64)> = vec![
            (abi::DT_STRTAB, STRTAB_VADDR),
            (abi::DT_STRSZ, STRTAB.len() as u64),
            (abi::DT_SYMTAB, SYMTAB_VADDR),
            (abi::DT_SYMENT, SYM_SIZE as u64),
            (abi::DT_HASH, HASH_VADDR),
            (abi::DT_BIND_NOW, 1),
            (abi::DT_FLAGS_1, layout.flags_1),
        ];
        if !layout.relas.is_empty() {
            dynamic.push((abi::DT_RELA, RELA_VADDR));
            dynamic.push((abi::DT_RELASZ, (layout.relas.len() * RELA_SIZE) as u64));
            dynamic.push((abi::DT_RELAENT, RELA_SIZE as u64));
        }
        for &off in &layout.needed {
            dynamic.push((abi::DT_NEEDED, off));
        }
        dynamic.extend_from_slice(&layout.extra_dynamic);
        dynamic.push((abi::DT_NULL, 0));
        let dyn_len = (dynamic.len() * DYN_SIZE) as u64;

        let mut phnum = 6;
        if layout.interp.is_some() {
            phnum += 1;
        }
        if !layout.with_relro {
            phnum -= 1;
        }
        if layout.with_tls {
            phnum += 1;
        }

        let mut image = Vec::new();
        // Ehdr
        image.extend_from_slice(&[0x7F, b'E', b'L', b'F']);
        image.push(abi::ELFCLASS64 as u8);
        image.push(abi::ELFDATA2LSB as u8);
        image.push(abi::EV_CURRENT as u8);
        image.extend_from_slice(&[0u8; 9]);
        push_u16(&mut image, abi::ET_DYN);
        push_u16(&mut image, layout.machine);
        push_u32(&mut image, 1);
        push_u64(&mut image, TEXT_VADDR); // e_entry
        push_u64(&mut image, EHDR_SIZE as u64); // e_phoff
        push_u64(&mut image, 0); // e_shoff
        push_u32(&mut image, 0); // e_flags
        push_u16(&mut image, EHDR_SIZE as u16);
        push_u16(&mut image, PHDR_SIZE as u16);
        push_u16(&mut image, phnum);
        push_u16(&mut image, SHDR_SIZE as u16); // e_shentsize
        push_u16(&mut image, 3); // e_shnum
        push_u16(&mut image, 2); // e_shstrndx

        // Phdrs
        push_phdr(
            &mut image,
            abi::PT_PHDR,
            abi::PF_R,
            EHDR_SIZE as u64,
            EHDR_SIZE as u64,
            (phnum as usize * PHDR_SIZE) as u64,
            (phnum as usize * PHDR_SIZE) as u64,
            8,
        );
        push_phdr(
            &mut image,
            abi::PT_LOAD,
            layout.text_flags,
            0,
            0,
            0x2000,
            0x2000,
            0x1000,
        );
        // Data segment with one page of bss behind it.
        push_phdr(
            &mut image,
            abi::PT_LOAD,
            abi::PF_R | abi::PF_W,
            DATA_VADDR,
            DATA_VADDR,
            0x1000,
            0x2000,
            0x1000,
        );
        push_phdr(
            &mut image,
            abi::PT_DYNAMIC,
            abi::PF_R,
            DYN_VADDR,
            DYN_VADDR,
            dyn_len,
            dyn_len,
            8,
        );
        push_phdr(&mut image, abi::PT_GNU_STACK, layout.stack_flags, 0, 0, 0, 0, 0x10);
        if layout.with_relro {
            push_phdr(
                &mut image,
                abi::PT_GNU_RELRO,
                abi::PF_R,
                GOT_VADDR,
                GOT_VADDR,
                0x100,
                0x100,
                1,
            );
        }
        if let Some(path) = layout.interp {
            push_phdr(
                &mut image,
                abi::PT_INTERP,
                abi::PF_R,
                INTERP_OFF,
                INTERP_OFF,
                path.len() as u64 + 1,
                path.len() as u64 + 1,
                1,
            );
        }
        if layout.with_tls {
            push_phdr(&mut image, abi::PT_TLS, abi::PF_R, 0, 0, 0, 8, 8);
        }

        image.resize(0x3000, 0);

        // .text: something non-zero at the entry.
        image[TEXT_VADDR as usize..TEXT_VADDR as usize + 4].copy_from_slice(&[0x13, 0, 0, 0]);

        // .dynamic
        let mut off = DYN_VADDR as usize;
        for (tag, val) in &dynamic {
            image[off..off + 8].copy_from_slice(&tag.to_le_bytes());
            image[off + 8..off + 16].copy_from_slice(&val.to_le_bytes());
            off += DYN_SIZE;
        }

        // .rela.dyn
        let mut off = RELA_VADDR as usize;
        for &(r_offset, rtype, symidx, addend) in &layout.relas {
            image[off..off + 8].copy_from_slice(&r_offset.to_le_bytes());
            let r_info = (symidx << 32) | rtype as u64;
            image[off + 8..off + 16].copy_from_slice(&r_info.to_le_bytes());
            image[off + 16..off + 24].copy_from_slice(&addend.to_le_bytes());
            off += RELA_SIZE;
        }

        // .symtab: the null symbol plus one undefined "ext_func".
        let sym1 = SYMTAB_VADDR as usize + SYM_SIZE;
        image[sym1..sym1 + 4].copy_from_slice(&1u32.to_le_bytes()); // st_name
        // st_shndx stays SHN_UNDEF, st_value stays 0.

        // .dynstr
        image[STRTAB_VADDR as usize..STRTAB_VADDR as usize + STRTAB.len()]
            .copy_from_slice(STRTAB);

        if let Some(path) = layout.interp {
            let off = INTERP_OFF as usize;
            image[off..off + path.len()].copy_from_slice(path.as_bytes());
        }

        image
    }

    fn image_file(layout: &ImageLayout) -> Arc<dyn File> {
        Arc::new(RamFile::new(build_image(layout)))
    }

    fn load_user(layout: &ImageLayout) -> SysResult<(Arc<AddrSpace>, ElfInfo)> {
        let space = AddrSpace::build_user();
        let file = image_file(layout);
        let info = load(&file, Some(&space), ElfFlags::empty(), None, None)?;
        Ok((space, info))
    }

    #[test]
    fn loads_a_valid_pie_and_applies_relocations() {
        let layout = ImageLayout {
            relas: vec![(GOT_VADDR + 0x10, R_RISCV_RELATIVE, 0, 0x1234)],
            ..ImageLayout::default()
        };
        let (space, info) = load_user(&layout).unwrap();

        // Invariant: without an interpreter, entry = base + e_entry.
        assert_eq!(info.entry, info.base + TEXT_VADDR as usize);
        assert_eq!(info.entry, info.real_entry);
        assert_eq!(info.map_size, 0x4000);
        assert_eq!(info.phnum, 6);
        assert_eq!(info.phent, PHDR_SIZE as u16);
        assert_eq!(info.phaddr, info.base + EHDR_SIZE);

        // Segments carry their declared protections.
        let text = space.find(VirtAddr::new(info.base + 0x1000)).unwrap();
        assert_eq!(text.prot, MemProt::RX);
        // The GOT page was sealed by PT_GNU_RELRO.
        let got = space.find(VirtAddr::new(info.base + GOT_VADDR as usize)).unwrap();
        assert_eq!(got.prot, MemProt::R);
        // The bss page is anonymous and writable.
        let bss = space.find(VirtAddr::new(info.base + 0x3000)).unwrap();
        assert_eq!(bss.prot, MemProt::RW);
        assert!(bss.flags.contains(MapFlags::ANONYMOUS));

        // The relative relocation landed.
        let mut slot = [0u8; 8];
        space
            .copy_in(VirtAddr::new(info.base + GOT_VADDR as usize + 0x10), &mut slot)
            .unwrap();
        assert_eq!(u64::from_le_bytes(slot), info.base as u64 + 0x1234);

        // Mapped text reads back from the file image.
        let mut insn = [0u8; 4];
        space.copy_in(VirtAddr::new(info.entry), &mut insn).unwrap();
        assert_eq!(insn, [0x13, 0, 0, 0]);
    }

    #[test]
    fn policy_rejections() {
        // Executable stack.
        let layout = ImageLayout {
            stack_flags: abi::PF_R | abi::PF_W | abi::PF_X,
            ..ImageLayout::default()
        };
        assert_eq!(load_user(&layout).unwrap_err(), SysError::ENOEXEC);

        // Writable and executable PT_LOAD.
        let layout = ImageLayout {
            text_flags: abi::PF_R | abi::PF_W | abi::PF_X,
            ..ImageLayout::default()
        };
        assert_eq!(load_user(&layout).unwrap_err(), SysError::ENOEXEC);

        // A main executable must be linked as PIE.
        let layout = ImageLayout {
            flags_1: abi::DF_1_NOW as u64,
            ..ImageLayout::default()
        };
        assert_eq!(load_user(&layout).unwrap_err(), SysError::ENOEXEC);

        // Lazy binding is rejected.
        let layout = ImageLayout {
            flags_1: abi::DF_1_PIE as u64,
            ..ImageLayout::default()
        };
        assert_eq!(load_user(&layout).unwrap_err(), SysError::ENOEXEC);

        // PT_GNU_RELRO is mandatory.
        let layout = ImageLayout {
            with_relro: false,
            ..ImageLayout::default()
        };
        assert_eq!(load_user(&layout).unwrap_err(), SysError::ENOEXEC);

        // PT_TLS is only allowed under an interpreter.
        let layout = ImageLayout {
            with_tls: true,
            ..ImageLayout::default()
        };
        assert_eq!(load_user(&layout).unwrap_err(), SysError::ENOEXEC);

        // Duplicated dynamic tags.
        let layout = ImageLayout {
            extra_dynamic: vec![(abi::DT_STRTAB, STRTAB_VADDR)],
            ..ImageLayout::default()
        };
        assert_eq!(load_user(&layout).unwrap_err(), SysError::ENOEXEC);

        // Wrong machine.
        let layout = ImageLayout {
            machine: abi::EM_X86_64,
            ..ImageLayout::default()
        };
        assert_eq!(load_user(&layout).unwrap_err(), SysError::ENOEXEC);

        // Undefined symbols are refused in userland.
        let layout = ImageLayout {
            relas: vec![(GOT_VADDR + 0x20, R_RISCV_JUMP_SLOT, 1, 0)],
            ..ImageLayout::default()
        };
        assert_eq!(load_user(&layout).unwrap_err(), SysError::EINVAL);
    }

    #[test]
    fn truncated_images_are_not_executable() {
        let image = build_image(&ImageLayout::default());
        let file: Arc<dyn File> = Arc::new(RamFile::new(image[..32].to_vec()));
        let space = AddrSpace::build_user();
        assert_eq!(
            load(&file, Some(&space), ElfFlags::empty(), None, None).unwrap_err(),
            SysError::ENOEXEC
        );
    }

    #[test]
    fn interpreter_chaining_reports_both_entries() {
        let fs = Arc::new(vfs::MapFs::new());
        let interp_layout = ImageLayout {
            flags_1: abi::DF_1_NOW as u64,
            ..ImageLayout::default()
        };
        fs.insert("/lib/ld.so", image_file(&interp_layout));
        vfs::register_root(fs);

        let main_layout = ImageLayout {
            interp: Some("/lib/ld.so"),
            ..ImageLayout::default()
        };
        let (space, info) = load_user(&main_layout).unwrap();

        assert_eq!(info.real_entry, info.base + TEXT_VADDR as usize);
        assert_ne!(info.entry, info.real_entry);
        // Both the binary and the interpreter are mapped executable.
        let mut insn = [0u8; 4];
        space.copy_in(VirtAddr::new(info.entry), &mut insn).unwrap();
        assert_eq!(insn, [0x13, 0, 0, 0]);
        let interp_text = space.find(VirtAddr::new(info.entry)).unwrap();
        assert_eq!(interp_text.prot, MemProt::RX);
    }

    #[test]
    fn kernel_module_links_against_ksym_and_resolver() {
        ksym::register("ext_func", 0xFFFF_FFC1_4000_0000);
        let layout = ImageLayout {
            flags_1: abi::DF_1_NOW as u64,
            relas: vec![
                (GOT_VADDR + 0x10, R_RISCV_RELATIVE, 0, 0x1234),
                (GOT_VADDR + 0x18, R_RISCV_JUMP_SLOT, 1, 0),
            ],
            needed: vec![10], // "libdep.so" in the string table
            ..ImageLayout::default()
        };
        let file = image_file(&layout);
        let mut deps: Vec<String> = Vec::new();
        let mut handler = |name: &str| {
            deps.push(name.to_string());
            Ok(())
        };
        let info = load(&file, None, ElfFlags::KMOD, Some(&mut handler), None).unwrap();
        assert_eq!(deps, vec!["libdep.so".to_string()]);
        assert_eq!(info.entry, info.base + TEXT_VADDR as usize);

        let mut slot = [0u8; 8];
        KSPACE
            .read(info.base + GOT_VADDR as usize + 0x10, &mut slot)
            .unwrap();
        assert_eq!(u64::from_le_bytes(slot), info.base as u64 + 0x1234);
        KSPACE
            .read(info.base + GOT_VADDR as usize + 0x18, &mut slot)
            .unwrap();
        assert_eq!(u64::from_le_bytes(slot), 0xFFFF_FFC1_4000_0000u64);
    }

    #[test]
    fn kernel_module_dependency_failure_aborts() {
        let layout = ImageLayout {
            flags_1: abi::DF_1_NOW as u64,
            needed: vec![10],
            ..ImageLayout::default()
        };
        let file = image_file(&layout);
        let mut handler = |_: &str| Err(SysError::ENOENT);
        assert_eq!(
            load(&file, None, ElfFlags::KMOD, Some(&mut handler), None).unwrap_err(),
            SysError::ENOENT
        );
    }
}
