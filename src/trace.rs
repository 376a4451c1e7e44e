use goblin::container::Endian;

use crate::arch::RegVal;
use crate::utils::Packer;

/// Everything the execution hooks read and update while the guest runs.
pub struct TraceState {
    pub status: StatusDiff,
    pub stacktrace: Stacktrace,
    pub blockloop: Option<LoopDetect>,
    pub memlog: MemLog,
    /// cleared when the current block fails the trace-match filter
    pub matching: bool,
    pub last_block: u64,
    pub deadlock: DeadlockCounter,
}

impl TraceState {
    pub fn new(endian: Endian, loop_collapse: usize) -> Self {
        Self {
            status: StatusDiff::default(),
            stacktrace: Stacktrace::default(),
            blockloop: if loop_collapse > 0 {
                Some(LoopDetect::new(loop_collapse))
            } else {
                None
            },
            memlog: MemLog::new(endian),
            matching: true,
            last_block: 0,
            deadlock: DeadlockCounter::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Change {
    pub name: &'static str,
    pub old: u64,
    pub new: u64,
}

#[derive(Clone, Debug, Default)]
pub struct Changes {
    pub list: Vec<Change>,
}

impl Changes {
    pub fn count(&self) -> usize {
        self.list.len()
    }

    /// Print the deltas; `inline` renders them on a single line for use
    /// after a disassembly column.
    pub fn print(&self, indent: &str, bits: u32, inline: bool) {
        let w = (bits / 4) as usize;
        if inline {
            let line: Vec<String> = self
                .list
                .iter()
                .map(|c| format!("{}=0x{:x}", c.name, c.new))
                .collect();
            eprintln!("{}{}", indent, line.join(" "));
        } else {
            for c in &self.list {
                eprintln!(
                    "{}{} 0x{:0w$x} -> 0x{:0w$x}",
                    indent,
                    c.name,
                    c.old,
                    c.new,
                    w = w
                );
            }
        }
    }
}

/// Register snapshot supporting delta reporting. The first call diffs
/// against all-zero, so it reports the nonzero initial state.
#[derive(Default)]
pub struct StatusDiff {
    last: Vec<RegVal>,
}

impl StatusDiff {
    pub fn changes(&mut self, current: &[RegVal]) -> Changes {
        let mut list = Vec::new();
        for rv in current {
            let old = self
                .last
                .iter()
                .find(|p| p.reg.enum_ == rv.reg.enum_)
                .map(|p| p.val)
                .unwrap_or(0);
            if old != rv.val {
                list.push(Change {
                    name: rv.reg.name,
                    old,
                    new: rv.val,
                });
            }
        }
        self.last = current.to_vec();
        Changes { list }
    }
}

#[derive(Clone, Debug)]
pub struct Frame {
    pub pc: u64,
    pub sp: u64,
    pub sym: String,
}

/// Call stack inferred from stack-pointer monotonicity: a block entered
/// with SP below the top frame pushes, SP rising above a frame pops it.
#[derive(Default)]
pub struct Stacktrace {
    pub stack: Vec<Frame>,
}

impl Stacktrace {
    pub fn update(&mut self, pc: u64, sp: u64, sym: String) {
        while let Some(top) = self.stack.last() {
            if sp > top.sp {
                self.stack.pop();
            } else {
                break;
            }
        }
        match self.stack.last_mut() {
            Some(top) if top.sp == sp => {
                top.pc = pc;
                top.sym = sym;
            }
            _ => self.stack.push(Frame { pc, sp, sym }),
        }
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn print(&self) {
        for frame in self.stack.iter().rev() {
            if frame.sym.is_empty() {
                eprintln!("  0x{:x}", frame.pc);
            } else {
                eprintln!("  0x{:x} ({})", frame.pc, frame.sym);
            }
        }
    }
}

/// Windowed block-chain recognizer. Once the last `n` block PCs repeat the
/// `n` before them, further repetitions are consumed silently; when the
/// chain breaks, one summary naming the chain and the repeat count is
/// reported.
pub struct LoopDetect {
    max: usize,
    history: Vec<u64>,
    chain: Vec<u64>,
    pos: usize,
    count: u64,
}

impl LoopDetect {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            history: Vec::new(),
            chain: Vec::new(),
            pos: 0,
            count: 0,
        }
    }

    /// A loop repetition is currently being consumed.
    pub fn active(&self) -> bool {
        !self.chain.is_empty()
    }

    /// Feed the next block PC. Returns `(suppress, closed)`: `suppress` is
    /// set while the PC is part of an ongoing repetition; `closed` carries
    /// `(chain, count)` when a collapsed loop just ended with count > 1.
    pub fn update(&mut self, pc: u64) -> (bool, Option<(Vec<u64>, u64)>) {
        if !self.chain.is_empty() {
            if pc == self.chain[self.pos] {
                self.pos += 1;
                if self.pos == self.chain.len() {
                    self.pos = 0;
                    self.count += 1;
                }
                return (true, None);
            }
            let chain = std::mem::take(&mut self.chain);
            let count = self.count;
            self.pos = 0;
            self.count = 0;
            self.history.clear();
            self.history.push(pc);
            return (false, if count > 1 { Some((chain, count)) } else { None });
        }
        self.history.push(pc);
        if self.history.len() > 2 * self.max {
            let excess = self.history.len() - 2 * self.max;
            self.history.drain(..excess);
        }
        for l in 1..=self.max {
            let n = self.history.len();
            if n >= 2 * l && self.history[n - l..] == self.history[n - 2 * l..n - l] {
                self.chain = self.history[n - l..].to_vec();
                self.pos = 0;
                self.count = 2;
                return (true, None);
            }
        }
        (false, None)
    }
}

#[derive(Clone, Debug)]
pub struct MemLogEntry {
    pub addr: u64,
    pub data: Vec<u8>,
    pub write: bool,
}

/// Batched memory trace. Accesses that continue the previous entry (same
/// direction, abutting address) coalesce; anything else starts a new entry.
pub struct MemLog {
    endian: Endian,
    entries: Vec<MemLogEntry>,
}

impl MemLog {
    pub fn new(endian: Endian) -> Self {
        Self {
            endian,
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether an access at `addr` would extend the latest entry. An empty
    /// log accepts anything.
    pub fn adjacent(&self, addr: u64, write: bool) -> bool {
        match self.entries.last() {
            Some(e) => e.write == write && addr == e.addr + e.data.len() as u64,
            None => true,
        }
    }

    pub fn update(&mut self, addr: u64, size: usize, value: i64, write: bool) {
        let bytes = Packer::new(self.endian, size as u8).pack(value as u64);
        if let Some(e) = self.entries.last_mut() {
            if e.write == write && addr == e.addr + e.data.len() as u64 {
                e.data.extend_from_slice(&bytes);
                return;
            }
        }
        self.entries.push(MemLogEntry {
            addr,
            data: bytes,
            write,
        });
    }

    pub fn print(&self, indent: &str, bits: u32) {
        let w = (bits / 4) as usize;
        for e in &self.entries {
            eprintln!(
                "{}{} 0x{:0w$x} 0x{}",
                indent,
                if e.write { "W" } else { "R" },
                e.addr,
                hex::encode(&e.data),
                w = w
            );
        }
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub fn entries(&self) -> &[MemLogEntry] {
        &self.entries
    }
}

/// Same PC observed repeatedly with no register change means the guest is
/// wedged. Any register change resets the counter before anything is
/// reported.
#[derive(Default)]
pub struct DeadlockCounter {
    last_pc: Option<u64>,
    count: u32,
}

impl DeadlockCounter {
    pub fn last_pc(&self) -> Option<u64> {
        self.last_pc
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Returns true when the observation crosses the fatal threshold.
    pub fn observe(&mut self, pc: u64, regs_changed: bool) -> bool {
        if self.last_pc == Some(pc) {
            if regs_changed {
                self.count = 0;
            } else {
                self.count += 1;
            }
        } else {
            self.count = 0;
        }
        self.last_pc = Some(pc);
        self.count > 2
    }
}

/// Allow-list test for trace gating: exact symbol, `sym+` prefix, or the
/// lowercase hex PC.
pub fn trace_matches(patterns: &[String], pc: u64, sym: &str) -> bool {
    let hex_pc = format!("0x{:x}", pc);
    patterns.iter().any(|p| {
        sym == p.as_str() || sym.starts_with(&format!("{}+", p)) || hex_pc == p.to_lowercase()
    })
}

/// Classic 16-bytes-per-line dump, grouped in 4-byte clusters.
pub fn hexdump(addr: u64, data: &[u8], bits: u32) -> Vec<String> {
    let w = (bits / 4) as usize;
    data.chunks(16)
        .enumerate()
        .map(|(i, chunk)| {
            let words: Vec<String> = chunk
                .chunks(4)
                .map(|c| c.iter().map(|b| format!("{:02x}", b)).collect())
                .collect();
            format!("0x{:0w$x}: {}", addr + (i * 16) as u64, words.join(" "), w = w)
        })
        .collect()
}

/// Raw-bytes code listing. Stands in for the external disassembler seam so
/// entry dumps and deadlock reports still show the code stream.
pub fn dump_code(addr: u64, data: &[u8], bits: u32) -> String {
    let w = (bits / 4) as usize;
    data.chunks(8)
        .enumerate()
        .map(|(i, chunk)| {
            let bytes: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
            format!("0x{:0w$x}: {}", addr + (i * 8) as u64, bytes.join(" "), w = w)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Reg;

    fn rv(enum_: i32, name: &'static str, val: u64) -> RegVal {
        RegVal {
            reg: Reg { enum_, name },
            val,
        }
    }

    #[test]
    fn test_status_diff_reports_deltas_and_updates() {
        let mut status = StatusDiff::default();
        let first = status.changes(&[rv(1, "a0", 0), rv(2, "a1", 7)]);
        assert_eq!(first.count(), 1);
        assert_eq!(first.list[0].name, "a1");

        let none = status.changes(&[rv(1, "a0", 0), rv(2, "a1", 7)]);
        assert_eq!(none.count(), 0);

        let second = status.changes(&[rv(1, "a0", 3), rv(2, "a1", 7)]);
        assert_eq!(second.count(), 1);
        assert_eq!(second.list[0].old, 0);
        assert_eq!(second.list[0].new, 3);
    }

    #[test]
    fn test_stacktrace_follows_stack_pointer() {
        let mut st = Stacktrace::default();
        st.update(0x100, 0x8000, "main".into());
        assert_eq!(st.len(), 1);

        // call: sp sinks
        st.update(0x200, 0x7ff0, "helper".into());
        assert_eq!(st.len(), 2);

        // block within the same frame
        st.update(0x210, 0x7ff0, "helper+0x10".into());
        assert_eq!(st.len(), 2);
        assert_eq!(st.stack[1].pc, 0x210);

        // return: sp rises
        st.update(0x110, 0x8000, "main+0x10".into());
        assert_eq!(st.len(), 1);
        assert_eq!(st.stack[0].pc, 0x110);
    }

    #[test]
    fn test_loop_detect_collapses_repeating_chain() {
        let mut ld = LoopDetect::new(4);
        let mut closed = None;
        let mut suppressed = 0;
        // chain a->b->c runs four times, then diverges
        for pc in [1u64, 2, 3, 1, 2, 3, 1, 2, 3, 1, 2, 3, 9] {
            let (s, c) = ld.update(pc);
            if s {
                suppressed += 1;
            }
            if let Some(c) = c {
                assert!(closed.is_none(), "loop reported twice");
                closed = Some(c);
            }
        }
        let (chain, count) = closed.expect("loop never closed");
        assert_eq!(chain, vec![1, 2, 3]);
        assert_eq!(count, 4);
        assert!(suppressed >= 6);
    }

    #[test]
    fn test_loop_detect_single_pass_is_silent() {
        let mut ld = LoopDetect::new(4);
        for pc in [1u64, 2, 3, 4, 5, 6, 7] {
            let (s, c) = ld.update(pc);
            assert!(!s);
            assert!(c.is_none());
        }
    }

    #[test]
    fn test_memlog_batches_adjacent_entries() {
        let mut ml = MemLog::new(Endian::Little);
        ml.update(0x100, 4, 0x11223344, true);
        assert!(ml.adjacent(0x104, true));
        ml.update(0x104, 4, 0x55667788, true);
        assert_eq!(ml.entries().len(), 1);
        assert_eq!(ml.entries()[0].data.len(), 8);

        // different direction does not coalesce
        assert!(!ml.adjacent(0x108, false));
        // a gap does not coalesce
        assert!(!ml.adjacent(0x200, true));
        ml.update(0x200, 4, 0x1, true);
        assert_eq!(ml.entries().len(), 2);
    }

    #[test]
    fn test_deadlock_counter_threshold_and_reset() {
        let mut dl = DeadlockCounter::default();
        assert!(!dl.observe(0x40, false));
        assert!(!dl.observe(0x40, false));
        assert!(!dl.observe(0x40, false));
        // fourth observation of the same pc crosses the threshold
        assert!(dl.observe(0x40, false));

        let mut dl = DeadlockCounter::default();
        assert!(!dl.observe(0x40, false));
        assert!(!dl.observe(0x40, false));
        assert!(!dl.observe(0x40, false));
        // a register change resets the count
        assert!(!dl.observe(0x40, true));
        assert!(!dl.observe(0x40, false));
        assert!(!dl.observe(0x40, false));
        assert!(dl.observe(0x40, false));

        let mut dl = DeadlockCounter::default();
        assert!(!dl.observe(0x40, false));
        assert!(!dl.observe(0x44, false));
        assert!(!dl.observe(0x40, false));
        assert!(!dl.observe(0x40, false));
    }

    #[test]
    fn test_trace_match_gating() {
        let patterns = vec!["main".to_string()];
        assert!(trace_matches(&patterns, 0x1000, "main"));
        assert!(trace_matches(&patterns, 0x1000, "main+0x10"));
        assert!(!trace_matches(&patterns, 0x1000, "printf"));
        assert!(!trace_matches(&patterns, 0x1000, "mainframe"));

        let patterns = vec!["0x4000".to_string(), "0X5000".to_string()];
        assert!(trace_matches(&patterns, 0x4000, ""));
        assert!(!trace_matches(&patterns, 0x4001, ""));
        // hex patterns compare case-insensitively
        assert!(trace_matches(&patterns, 0x5000, ""));
    }

    #[test]
    fn test_hexdump_shape() {
        let lines = hexdump(0x1000, &[0xde, 0xad, 0xbe, 0xef, 0x01], 32);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("0x00001000: deadbeef 01"));
    }
}
