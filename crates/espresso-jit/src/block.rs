//! Translation units: blocks, targets, and forward-label resolution.
//!
//! One unit translates a contiguous span of guest code in a single forward
//! pass. Branches to addresses whose code already exists become direct rel32
//! transfers; branches to not-yet-emitted addresses go through a lazily
//! created label that is bound exactly once, when translation reaches the
//! target. Finalize fails if any label is still unbound; the alternative is
//! a code buffer with dangling transfers.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::emit::{Assembler, CodegenError, Cond};
use crate::regs::RegisterMap;

/// Fixed guest instruction width.
pub const GUEST_INSTR_BYTES: u32 = 4;

/// Default per-unit instruction ceiling. Bounds the cost and code size of
/// pathological non-looping sequences; hitting it is a defined stop, not an
/// error.
pub const MAX_BLOCK_INSTRUCTIONS: u32 = 20_000;

/// Tunable bounds for one translation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLimits {
    pub max_instructions: u32,
}

impl Default for BlockLimits {
    fn default() -> Self {
        Self {
            max_instructions: MAX_BLOCK_INSTRUCTIONS,
        }
    }
}

/// Address of compiled host code. Stored as a plain address so blocks can be
/// shared across threads; [`CodePtr::as_ptr`] recovers the callable pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodePtr(usize);

impl CodePtr {
    pub fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    pub fn addr(self) -> usize {
        self.0
    }

    pub fn as_ptr(self) -> *const u8 {
        self.0 as *const u8
    }
}

/// Why a unit stopped translating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEnd {
    /// An unconditional terminal instruction ended the unit.
    Terminal,
    /// The instruction ceiling was hit. Execution must be handed to a
    /// fallback path at exactly `next_address`.
    CeilingReached { next_address: u32 },
}

/// One translated unit of guest code.
///
/// `targets` maps every guest address translated within the unit to its
/// compiled entry, so external callers can jump into the middle of the block
/// (loop back-edges, mid-block external jumps) without re-translating from
/// `start`. An address appears at most once; its entry is recorded only
/// after the code for that address has been fully emitted.
#[derive(Debug)]
pub struct JitBlock {
    pub start: u32,
    pub end: u32,
    pub end_kind: BlockEnd,
    /// Compiled entry for `start`.
    pub entry: Option<CodePtr>,
    pub targets: BTreeMap<u32, CodePtr>,
}

impl JitBlock {
    pub fn contains(&self, address: u32) -> bool {
        self.start <= address && address < self.end
    }

    pub fn entry_for(&self, address: u32) -> Option<CodePtr> {
        self.targets.get(&address).copied()
    }
}

/// Control-flow effect of one translated guest instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Fall through to the next instruction.
    Continue,
    /// The instruction branches to `target`, which must lie within the span
    /// this unit is expected to cover; branches that leave the unit must be
    /// emitted by the decoder as an exit (set `nia`, jump to the finale) and
    /// reported as [`Step::Terminal`].
    Jump {
        target: u32,
        /// `Some` for a conditional branch (translation continues past it),
        /// `None` for an unconditional one.
        cond: Option<Cond>,
        /// For an unconditional branch: whether the unit ends here. A
        /// non-terminal unconditional jump keeps translating so that forward
        /// labels (e.g. the join point of an if/else) can still be bound.
        terminal: bool,
    },
    /// Unconditional terminal instruction; the decoder has emitted the
    /// unit's exit code.
    Terminal,
}

/// Decoder-side driver of translation, one guest instruction at a time.
///
/// The decoder owns opcode semantics; the translator owns bookkeeping. For
/// each address the decoder emits host code through `asm`/`map` and reports
/// the instruction's control-flow shape.
pub trait BlockDecoder {
    fn translate(
        &mut self,
        asm: &mut Assembler,
        map: &RegisterMap,
        address: u32,
    ) -> Result<Step, CodegenError>;
}

#[derive(Debug, Error)]
pub enum TranslateError {
    /// A branch referenced an address never reached within this unit. The
    /// unit must not be made executable.
    #[error("unresolved branch target {address:#010x} at finalize")]
    UnboundLabel { address: u32 },
    #[error("code generation failed")]
    Codegen(#[from] CodegenError),
}

/// A finished unit that has not yet been installed into executable memory.
/// Offsets are relative to `code`; the runtime rebases them when it copies
/// the buffer into the executable region.
#[derive(Debug)]
pub struct PendingBlock {
    pub start: u32,
    pub end: u32,
    pub end_kind: BlockEnd,
    pub code: Vec<u8>,
    pub target_offsets: BTreeMap<u32, usize>,
}

impl PendingBlock {
    /// Rebase into a [`JitBlock`] whose entries point into the executable
    /// copy of `code` at `base`.
    pub fn into_block(self, base: usize) -> JitBlock {
        let targets: BTreeMap<u32, CodePtr> = self
            .target_offsets
            .into_iter()
            .map(|(addr, off)| (addr, CodePtr::from_addr(base + off)))
            .collect();
        let entry = targets.get(&self.start).copied();
        JitBlock {
            start: self.start,
            end: self.end,
            end_kind: self.end_kind,
            entry,
            targets,
        }
    }
}

/// Translate one unit starting at `start`, driven by `decoder`.
///
/// Single forward pass. Any pending label for an address is bound before the
/// address's code is emitted, and every translated address lands in the
/// target table, so back-edges and forward branches resolve against the same
/// bookkeeping.
pub fn translate_unit<D: BlockDecoder>(
    start: u32,
    decoder: &mut D,
    map: &RegisterMap,
    limits: BlockLimits,
) -> Result<PendingBlock, TranslateError> {
    let mut asm = Assembler::new();
    let mut labels: HashMap<u32, crate::emit::Label> = HashMap::new();
    let mut target_offsets: BTreeMap<u32, usize> = BTreeMap::new();

    let mut address = start;
    let mut translated: u32 = 0;

    let end_kind = loop {
        if translated == limits.max_instructions {
            break BlockEnd::CeilingReached {
                next_address: address,
            };
        }

        // Reaching a pending forward target: bind its label before emitting
        // the target's code.
        if let Some(&label) = labels.get(&address) {
            asm.bind(label);
        }
        target_offsets.insert(address, asm.offset());

        let step = decoder.translate(&mut asm, map, address)?;
        if let Some(err) = asm.failure() {
            // Fatal-by-default policy: abort the unit and surface the error.
            return Err(err.clone().into());
        }

        translated += 1;
        address = address.wrapping_add(GUEST_INSTR_BYTES);

        match step {
            Step::Continue => {}
            Step::Jump {
                target,
                cond,
                terminal,
            } => {
                if let Some(&resolved) = target_offsets.get(&target) {
                    match cond {
                        Some(cc) => asm.jcc_offset(cc, resolved),
                        None => asm.jmp_offset(resolved),
                    }
                } else {
                    let label = *labels.entry(target).or_insert_with(|| asm.new_label());
                    match cond {
                        Some(cc) => asm.jcc(cc, label),
                        None => asm.jmp(label),
                    }
                }
                if cond.is_none() && terminal {
                    break BlockEnd::Terminal;
                }
            }
            Step::Terminal => break BlockEnd::Terminal,
        }
    };

    // Finalize: a label still unbound here means a branch referenced an
    // address this unit never reached.
    for (&target, &label) in &labels {
        if !asm.is_bound(label) {
            return Err(TranslateError::UnboundLabel { address: target });
        }
    }

    let code = asm.finish()?;
    Ok(PendingBlock {
        start,
        end: address,
        end_kind,
        code,
        target_offsets,
    })
}
