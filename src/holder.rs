//! `CodeHolder`: sections, labels, relocations, and attached emitters.

use crate::buffer::CodeOffset;
use crate::emitter::{Emitter, EmitterId, ErrorHandler};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::fmt::Logger;
use crate::label::{Label, LabelEntry, LabelType};
use crate::reloc::{RelocEntry, RelocKind, RelocTarget};
use crate::section::{Section, SectionFlags, SectionId};
use log::trace;
use rustc_hash::FxHashMap;
use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

/// Label ids are dense `u32`s; keep a bit in reserve so id arithmetic can
/// never overflow.
const LABEL_LIMIT: usize = 0x7FFF_FFFF;

pub(crate) struct HolderInner {
    pub(crate) env: Environment,
    pub(crate) sections: Vec<Section>,
    pub(crate) labels: Vec<LabelEntry>,
    pub(crate) relocs: Vec<RelocEntry>,
    label_names: FxHashMap<(Option<Label>, String), Label>,
    pub(crate) attached: Vec<EmitterId>,
    next_emitter_id: u32,
    pub(crate) logger: Option<Box<dyn Logger>>,
    pub(crate) error_handler: Option<Box<dyn ErrorHandler>>,
    pub(crate) settings_generation: u64,
    flattened: bool,
}

impl HolderInner {
    fn new(env: Environment) -> Self {
        let mut inner = Self {
            env,
            sections: Vec::new(),
            labels: Vec::new(),
            relocs: Vec::new(),
            label_names: FxHashMap::default(),
            attached: Vec::new(),
            next_emitter_id: 0,
            logger: None,
            error_handler: None,
            settings_generation: 0,
            flattened: false,
        };
        inner.init_text_section();
        inner
    }

    fn init_text_section(&mut self) {
        let alignment = self.env.arch().inst_alignment();
        self.sections.push(Section::new(
            SectionId::TEXT,
            ".text",
            SectionFlags::EXECUTABLE,
            alignment,
        ));
    }

    pub(crate) fn section_ok(&self, id: SectionId) -> Result<()> {
        if id.index() < self.sections.len() {
            Ok(())
        } else {
            Err(Error::InvalidSection)
        }
    }

    pub(crate) fn label_ok(&self, label: Label) -> Result<()> {
        if label.index() < self.labels.len() {
            Ok(())
        } else {
            Err(Error::InvalidLabel)
        }
    }

    pub(crate) fn log(&mut self, line: &str) {
        if let Some(logger) = self.logger.as_deref_mut() {
            logger.log(line);
        }
    }
}

/// Owns every section, label, and relocation of one unit of generated code,
/// plus the registry of attached emitters.
///
/// `CodeHolder` is a cheap-clone handle; all clones refer to the same
/// underlying state. A holder and its attached emitters form one
/// single-threaded unit (there is no internal locking), so the handle is
/// intentionally neither `Send` nor `Sync`. After construction the holder
/// always has one `.text` section with id [`SectionId::TEXT`] whose
/// alignment matches the architecture's instruction alignment.
#[derive(Clone)]
pub struct CodeHolder {
    inner: Rc<RefCell<HolderInner>>,
}

impl CodeHolder {
    pub fn new(env: Environment) -> Self {
        Self { inner: Rc::new(RefCell::new(HolderInner::new(env))) }
    }

    pub(crate) fn borrow(&self) -> Ref<'_, HolderInner> {
        self.inner.borrow()
    }

    pub(crate) fn borrow_mut(&self) -> RefMut<'_, HolderInner> {
        self.inner.borrow_mut()
    }

    pub(crate) fn ptr_eq(&self, other: &CodeHolder) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn env(&self) -> Environment {
        self.borrow().env
    }

    /// Re-initialize the holder for a different target environment. All
    /// emitters must be detached first, since they cache per-arch state.
    pub fn init(&self, env: Environment) -> Result<()> {
        {
            let mut inner = self.borrow_mut();
            if !inner.attached.is_empty() {
                return Err(Error::InvalidState);
            }
            inner.env = env;
        }
        self.reset();
        Ok(())
    }

    /// Drop all sections, labels and relocations, returning the holder to
    /// its freshly-constructed state. Attached emitters stay attached;
    /// their active section becomes `.text` again.
    pub fn reset(&self) {
        let mut inner = self.borrow_mut();
        inner.sections.clear();
        inner.labels.clear();
        inner.relocs.clear();
        inner.label_names.clear();
        inner.flattened = false;
        inner.settings_generation += 1;
        inner.init_text_section();
    }

    // ------------------------------------------------------------------
    // Emitter attachment

    /// Attach `emitter` to this holder and fire its `on_attach` event.
    pub fn attach<E: Emitter + ?Sized>(&self, emitter: &mut E) -> Result<()> {
        if emitter.state().code().is_some() {
            return Err(Error::AlreadyAttached);
        }
        let (id, arch) = {
            let mut inner = self.borrow_mut();
            let id = EmitterId::from_u32(inner.next_emitter_id);
            inner.next_emitter_id += 1;
            inner.attached.push(id);
            (id, inner.env.arch())
        };
        emitter.state_mut().attach_to(self.clone(), id, arch);
        emitter.on_attach();
        trace!("attached emitter {id} ({:?})", emitter.state().kind());
        Ok(())
    }

    /// Detach `emitter`, firing its `on_detach` event first.
    pub fn detach<E: Emitter + ?Sized>(&self, emitter: &mut E) -> Result<()> {
        let attached_here = emitter.state().code().is_some_and(|code| code.ptr_eq(self));
        if !attached_here {
            return Err(Error::NotAttached);
        }
        emitter.on_detach();
        let id = emitter.state().id().expect("attached emitter has an id");
        self.borrow_mut().attached.retain(|&e| e != id);
        emitter.state_mut().clear_attachment();
        trace!("detached emitter {id}");
        Ok(())
    }

    /// Number of currently attached emitters.
    pub fn attached_count(&self) -> usize {
        self.borrow().attached.len()
    }

    // ------------------------------------------------------------------
    // Sections

    /// Create a section. `alignment` must be a power of two.
    pub fn new_section(&self, name: &str, flags: SectionFlags, alignment: u32) -> Result<SectionId> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(Error::InvalidArgument);
        }
        let mut inner = self.borrow_mut();
        let id = SectionId::from_u32(u32::try_from(inner.sections.len()).unwrap());
        inner.sections.push(Section::new(id, name, flags, alignment));
        trace!("new section {id} {name:?} align={alignment}");
        Ok(id)
    }

    pub fn section_count(&self) -> usize {
        self.borrow().sections.len()
    }

    /// The implicit `.text` section every holder starts with.
    pub fn text_section(&self) -> SectionId {
        SectionId::TEXT
    }

    /// Borrow the section table. The borrow must be released before any
    /// mutating holder or emitter operation runs.
    pub fn sections(&self) -> Ref<'_, [Section]> {
        Ref::map(self.borrow(), |inner| inner.sections.as_slice())
    }

    pub fn section_by_name(&self, name: &str) -> Option<SectionId> {
        self.borrow().sections.iter().find(|s| s.name() == name).map(Section::id)
    }

    /// A copy of the section's current bytes.
    pub fn section_data(&self, id: SectionId) -> Result<Vec<u8>> {
        let inner = self.borrow();
        inner.section_ok(id)?;
        Ok(inner.sections[id.index()].data().to_vec())
    }

    pub fn section_size(&self, id: SectionId) -> Result<CodeOffset> {
        let inner = self.borrow();
        inner.section_ok(id)?;
        Ok(inner.sections[id.index()].size())
    }

    /// Total bytes across all sections, before any flattening padding.
    pub fn code_size(&self) -> u64 {
        self.borrow().sections.iter().map(|s| u64::from(s.size())).sum()
    }

    // ------------------------------------------------------------------
    // Labels

    fn alloc_label(&self, entry: LabelEntry) -> Result<Label> {
        let mut inner = self.borrow_mut();
        if inner.labels.len() >= LABEL_LIMIT {
            return Err(Error::TooManyLabels);
        }
        let label = Label::from_u32(u32::try_from(inner.labels.len()).unwrap());
        if let Some(name) = entry.name.clone() {
            match entry.label_type {
                LabelType::Global | LabelType::Local => {
                    let key = (entry.parent, name);
                    if inner.label_names.contains_key(&key) {
                        return Err(Error::LabelNameCollision);
                    }
                    inner.label_names.insert(key, label);
                }
                // External names resolve to the first registration;
                // anonymous names are annotation only.
                LabelType::External => {
                    inner.label_names.entry((None, name)).or_insert(label);
                }
                LabelType::Anonymous => {}
            }
        }
        inner.labels.push(entry);
        Ok(label)
    }

    /// Create an unnamed, unbound label.
    pub fn new_label(&self) -> Result<Label> {
        self.alloc_label(LabelEntry::new(LabelType::Anonymous, None, None))
    }

    /// Create a named label. Global and local names must be unique within
    /// their namespace; `parent` scopes local labels and must be `None`
    /// otherwise.
    pub fn new_named_label(
        &self,
        name: &str,
        label_type: LabelType,
        parent: Option<Label>,
    ) -> Result<Label> {
        if name.is_empty() {
            return Err(Error::InvalidArgument);
        }
        match label_type {
            LabelType::Local => {}
            LabelType::Anonymous | LabelType::Global | LabelType::External => {
                if parent.is_some() {
                    return Err(Error::InvalidArgument);
                }
            }
        }
        if let Some(parent) = parent {
            self.borrow().label_ok(parent)?;
        }
        self.alloc_label(LabelEntry::new(label_type, Some(name.to_string()), parent))
    }

    /// Create a label naming a symbol resolved outside this holder.
    pub fn new_external_label(&self, name: &str) -> Result<Label> {
        self.new_named_label(name, LabelType::External, None)
    }

    /// Create an anonymous label carrying a purely informational name;
    /// duplicate anonymous names are allowed.
    pub fn new_anonymous_label(&self, name: &str) -> Result<Label> {
        if name.is_empty() {
            return Err(Error::InvalidArgument);
        }
        self.alloc_label(LabelEntry::new(LabelType::Anonymous, Some(name.to_string()), None))
    }

    pub fn label_by_name(&self, name: &str, parent: Option<Label>) -> Option<Label> {
        self.borrow().label_names.get(&(parent, name.to_string())).copied()
    }

    pub fn is_label_valid(&self, label: Label) -> bool {
        label.index() < self.borrow().labels.len()
    }

    pub fn is_label_bound(&self, label: Label) -> bool {
        self.borrow().labels.get(label.index()).is_some_and(LabelEntry::is_bound)
    }

    pub fn label_type(&self, label: Label) -> Result<LabelType> {
        let inner = self.borrow();
        inner.label_ok(label)?;
        Ok(inner.labels[label.index()].label_type)
    }

    /// The bind point of a bound label.
    pub fn label_bind_point(&self, label: Label) -> Result<(SectionId, CodeOffset)> {
        let inner = self.borrow();
        inner.label_ok(label)?;
        let entry = &inner.labels[label.index()];
        match entry.section {
            Some(section) => Ok((section, entry.offset)),
            None => Err(Error::InvalidState),
        }
    }

    /// Number of unresolved references to `label`.
    pub fn label_link_count(&self, label: Label) -> Result<usize> {
        let inner = self.borrow();
        inner.label_ok(label)?;
        Ok(inner.labels[label.index()].links.len())
    }

    /// Bind `label` to `(section, offset)` and patch every recorded
    /// reference.
    ///
    /// References in the same section are patched in place; references in
    /// other sections become relative relocation entries resolved by
    /// [`resolve_cross_section`](Self::resolve_cross_section). A label binds
    /// exactly once; a displacement that does not fit its patch-site
    /// encoding fails the whole binding with `RelocationOutOfRange`.
    pub fn bind_label(&self, label: Label, section: SectionId, offset: CodeOffset) -> Result<()> {
        let mut inner = self.borrow_mut();
        inner.label_ok(label)?;
        inner.section_ok(section)?;
        let entry = &inner.labels[label.index()];
        if entry.label_type == LabelType::External {
            return Err(Error::InvalidArgument);
        }
        if entry.is_bound() {
            return Err(Error::AlreadyBound);
        }
        if offset > inner.sections[section.index()].size() {
            return Err(Error::InvalidArgument);
        }

        trace!("bind {label} -> {section}+{offset:#x}");
        let links = {
            let entry = &mut inner.labels[label.index()];
            entry.section = Some(section);
            entry.offset = offset;
            core::mem::take(&mut entry.links)
        };
        for site in links {
            if site.section == section {
                let disp = i64::from(offset) - i64::from(site.offset + site.encoding.pcrel_base());
                let buffer = &mut inner.sections[site.section.index()].buffer;
                site.encoding.patch(buffer, site.offset, disp)?;
            } else {
                inner
                    .relocs
                    .push(RelocEntry::relative(site.section, site.offset, label, site.encoding));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Relocations

    /// Record a relocation entry.
    pub fn add_relocation(&self, entry: RelocEntry) {
        self.borrow_mut().relocs.push(entry);
    }

    /// A copy of the current relocation table.
    pub fn relocations(&self) -> Vec<RelocEntry> {
        self.borrow().relocs.clone()
    }

    /// After [`flatten`](Self::flatten), rewrite cross-section references
    /// that are encodable inline. Entries that stay out of range, target
    /// unbound labels, or require the final load address survive as output
    /// relocations.
    pub fn resolve_cross_section(&self) -> Result<()> {
        let mut inner = self.borrow_mut();
        if !inner.flattened {
            return Err(Error::InvalidState);
        }
        let inner = &mut *inner;
        let mut remaining = Vec::with_capacity(inner.relocs.len());
        for entry in inner.relocs.drain(..) {
            match resolve_one(&mut inner.sections, &inner.labels, &entry) {
                Resolution::Done => {}
                Resolution::Keep => remaining.push(entry),
                Resolution::Fail(err) => return Err(err),
            }
        }
        inner.relocs = remaining;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Final layout

    /// Assign final contiguous offsets to all sections obeying their
    /// alignment; returns the total image size.
    pub fn flatten(&self) -> Result<u64> {
        let mut inner = self.borrow_mut();
        let mut offset: u64 = 0;
        for section in &mut inner.sections {
            let align = u64::from(section.alignment());
            offset = offset.checked_add(align - 1).ok_or(Error::OutOfMemory)? & !(align - 1);
            section.final_offset = Some(offset);
            offset += u64::from(section.size());
        }
        inner.flattened = true;
        trace!("flattened {} sections, {offset:#x} bytes", inner.sections.len());
        Ok(offset)
    }

    /// Serialize all flattened sections into `dst`, zero-filling alignment
    /// gaps. Returns the number of bytes written.
    pub fn copy_flattened_data(&self, dst: &mut [u8]) -> Result<usize> {
        let inner = self.borrow();
        if !inner.flattened {
            return Err(Error::InvalidState);
        }
        let total = inner
            .sections
            .iter()
            .map(|s| s.final_offset.unwrap() + u64::from(s.size()))
            .max()
            .unwrap_or(0);
        let total = usize::try_from(total).map_err(|_| Error::OutOfMemory)?;
        if dst.len() < total {
            return Err(Error::InvalidArgument);
        }
        dst[..total].fill(0);
        for section in &inner.sections {
            let at = usize::try_from(section.final_offset.unwrap()).unwrap();
            dst[at..at + section.data().len()].copy_from_slice(section.data());
        }
        Ok(total)
    }

    // ------------------------------------------------------------------
    // Logging and error routing

    /// Install (or clear) the holder-level logger inherited by attached
    /// emitters without their own.
    pub fn set_logger(&self, logger: Option<Box<dyn Logger>>) {
        let mut inner = self.borrow_mut();
        inner.logger = logger;
        inner.settings_generation += 1;
    }

    pub fn has_logger(&self) -> bool {
        self.borrow().logger.is_some()
    }

    /// Install (or clear) the holder-level error handler inherited by
    /// attached emitters without their own.
    pub fn set_error_handler(&self, handler: Option<Box<dyn ErrorHandler>>) {
        let mut inner = self.borrow_mut();
        inner.error_handler = handler;
        inner.settings_generation += 1;
    }

    pub fn has_error_handler(&self) -> bool {
        self.borrow().error_handler.is_some()
    }

    /// Bumped whenever holder-level logger/handler settings change;
    /// emitters use this to refresh cached settings lazily.
    pub fn settings_generation(&self) -> u64 {
        self.borrow().settings_generation
    }
}

enum Resolution {
    Done,
    Keep,
    Fail(Error),
}

fn global_offset(sections: &[Section], labels: &[LabelEntry], label: Label) -> Option<u64> {
    let entry = labels.get(label.index())?;
    let section = entry.section?;
    let base = sections[section.index()].final_offset?;
    Some(base + u64::from(entry.offset))
}

#[allow(clippy::cast_possible_wrap)]
fn resolve_one(sections: &mut [Section], labels: &[LabelEntry], entry: &RelocEntry) -> Resolution {
    match entry.kind {
        RelocKind::Absolute => Resolution::Keep,
        RelocKind::Relative => {
            let RelocTarget::Label(label) = entry.target else {
                return Resolution::Keep;
            };
            let Some(encoding) = entry.encoding else {
                return Resolution::Keep;
            };
            let Some(target) = global_offset(sections, labels, label) else {
                return Resolution::Keep;
            };
            let src_base = sections[entry.src_section.index()].final_offset.unwrap();
            let site = src_base + u64::from(entry.src_offset + encoding.pcrel_base());
            let disp = (target as i64) - (site as i64) + entry.addend;
            if !encoding.fits(disp) {
                return Resolution::Keep;
            }
            let buffer = &mut sections[entry.src_section.index()].buffer;
            match encoding.patch(buffer, entry.src_offset, disp) {
                Ok(()) => Resolution::Done,
                Err(err) => Resolution::Fail(err),
            }
        }
        RelocKind::Expr => {
            let RelocTarget::Label(label) = entry.target else {
                return Resolution::Keep;
            };
            let Some(base_label) = entry.base else {
                return Resolution::Fail(Error::InvalidArgument);
            };
            let (Some(target), Some(base)) = (
                global_offset(sections, labels, label),
                global_offset(sections, labels, base_label),
            ) else {
                return Resolution::Keep;
            };
            let value = (target as i64) - (base as i64) + entry.addend;
            let in_range = match entry.size {
                1 => i8::try_from(value).is_ok(),
                2 => i16::try_from(value).is_ok(),
                4 => i32::try_from(value).is_ok(),
                8 => true,
                _ => return Resolution::Fail(Error::InvalidArgument),
            };
            if !in_range {
                return Resolution::Fail(Error::RelocationOutOfRange);
            }
            let buffer = &mut sections[entry.src_section.index()].buffer;
            #[allow(clippy::cast_sign_loss)]
            match entry.size {
                1 => buffer.write_u8_at(entry.src_offset, value as u8),
                2 => {
                    buffer.write_u8_at(entry.src_offset, value as u8);
                    buffer.write_u8_at(entry.src_offset + 1, (value >> 8) as u8);
                }
                4 => buffer.write_u32_at(entry.src_offset, value as u32),
                _ => buffer.write_u64_at(entry.src_offset, value as u64),
            }
            Resolution::Done
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Arch;

    fn holder() -> CodeHolder {
        CodeHolder::new(Environment::new(Arch::X64))
    }

    #[test]
    fn text_section_exists_after_new_and_reset() {
        let code = holder();
        assert_eq!(code.section_count(), 1);
        assert_eq!(code.section_by_name(".text"), Some(SectionId::TEXT));
        code.new_section(".data", SectionFlags::WRITABLE, 8).unwrap();
        code.reset();
        assert_eq!(code.section_count(), 1);
        assert_eq!(code.section_by_name(".data"), None);
    }

    #[test]
    fn section_alignment_must_be_power_of_two() {
        let code = holder();
        assert_eq!(
            code.new_section(".data", SectionFlags::WRITABLE, 3),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            code.new_section(".data", SectionFlags::WRITABLE, 0),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn named_label_collision() {
        let code = holder();
        code.new_named_label("entry", LabelType::Global, None).unwrap();
        assert_eq!(
            code.new_named_label("entry", LabelType::Global, None),
            Err(Error::LabelNameCollision)
        );
        // Two anonymous labels may share a name.
        code.new_anonymous_label("tmp").unwrap();
        code.new_anonymous_label("tmp").unwrap();
    }

    #[test]
    fn local_labels_are_scoped_by_parent() {
        let code = holder();
        let f = code.new_named_label("f", LabelType::Global, None).unwrap();
        let g = code.new_named_label("g", LabelType::Global, None).unwrap();
        let a = code.new_named_label("loop", LabelType::Local, Some(f)).unwrap();
        let b = code.new_named_label("loop", LabelType::Local, Some(g)).unwrap();
        assert_ne!(a, b);
        assert_eq!(code.label_by_name("loop", Some(f)), Some(a));
        assert_eq!(code.label_by_name("loop", Some(g)), Some(b));
        assert_eq!(
            code.new_named_label("loop", LabelType::Local, Some(f)),
            Err(Error::LabelNameCollision)
        );
    }

    #[test]
    fn double_bind_is_rejected() {
        let code = holder();
        let label = code.new_label().unwrap();
        code.bind_label(label, SectionId::TEXT, 0).unwrap();
        assert_eq!(code.bind_label(label, SectionId::TEXT, 0), Err(Error::AlreadyBound));
    }

    #[test]
    fn bind_validates_ids() {
        let code = holder();
        let label = code.new_label().unwrap();
        assert_eq!(
            code.bind_label(Label::from_u32(7), SectionId::TEXT, 0),
            Err(Error::InvalidLabel)
        );
        assert_eq!(
            code.bind_label(label, SectionId::from_u32(9), 0),
            Err(Error::InvalidSection)
        );
        // Offsets past the end of the section are rejected.
        assert_eq!(code.bind_label(label, SectionId::TEXT, 4), Err(Error::InvalidArgument));
    }

    #[test]
    fn external_labels_cannot_bind() {
        let code = holder();
        let ext = code.new_external_label("memcpy").unwrap();
        assert_eq!(code.bind_label(ext, SectionId::TEXT, 0), Err(Error::InvalidArgument));
        assert_eq!(code.label_by_name("memcpy", None), Some(ext));
    }

    #[test]
    fn flatten_assigns_aligned_offsets() {
        let code = holder();
        let data = code.new_section(".data", SectionFlags::WRITABLE, 16).unwrap();
        {
            let mut inner = code.borrow_mut();
            inner.sections[SectionId::TEXT.index()].buffer.put_bytes(&[0x90; 3]);
            inner.sections[data.index()].buffer.put8(0xDEAD_BEEF);
        }
        let total = code.flatten().unwrap();
        assert_eq!(total, 24);
        let sections = code.sections();
        assert_eq!(sections[0].final_offset(), Some(0));
        assert_eq!(sections[1].final_offset(), Some(16));
        drop(sections);

        let mut image = vec![0xFF; 24];
        let written = code.copy_flattened_data(&mut image).unwrap();
        assert_eq!(written, 24);
        assert_eq!(&image[..3], &[0x90; 3]);
        assert_eq!(&image[3..16], &[0; 13], "alignment gap is zero-filled");
        assert_eq!(&image[16..24], &0xDEAD_BEEFu64.to_le_bytes());
    }

    #[test]
    fn copy_requires_flatten_and_capacity() {
        let code = holder();
        let mut buf = [0u8; 4];
        assert_eq!(code.copy_flattened_data(&mut buf), Err(Error::InvalidState));
        code.flatten().unwrap();
        assert_eq!(code.copy_flattened_data(&mut buf), Ok(0));
    }

    #[test]
    fn init_switches_environments_when_detached() {
        use crate::assembler::Assembler;
        use crate::emitter::Emitter;

        let code = holder();
        let mut asm = Assembler::new(&code).unwrap();
        assert_eq!(
            code.init(Environment::new(Arch::Aarch64)),
            Err(Error::InvalidState)
        );
        code.detach(&mut asm).unwrap();
        code.init(Environment::new(Arch::Aarch64)).unwrap();
        assert_eq!(code.env().arch(), Arch::Aarch64);
        // The fresh .text section follows the new arch's alignment.
        assert_eq!(code.sections()[0].alignment(), 4);
    }

    #[test]
    fn settings_generation_tracks_changes() {
        let code = holder();
        let g0 = code.settings_generation();
        code.set_logger(Some(Box::new(crate::fmt::StringLogger::new())));
        assert!(code.settings_generation() > g0);
        assert!(code.has_logger());
    }
}
