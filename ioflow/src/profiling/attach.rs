//! # Kprobe Attachment with Hook Fallbacks
//!
//! Every program names the kernel functions it may bind to, primary first.
//! Hooks renamed or removed across kernel versions are skipped by checking
//! `/proc/kallsyms` before attaching. A program with no usable hook is
//! omitted from the session; it never aborts the session.

use aya::programs::kprobe::KProbeLinkId;
use aya::programs::KProbe;
use aya::Ebpf;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader};

use crate::domain::AttachError;

/// How a program's candidate hooks are used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachPolicy {
    /// Attach to the first hook that exists
    FirstAvailable,
    /// Attach to every hook that exists
    EveryAvailable,
}

/// An eBPF program and the kernel functions it may attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSpec {
    pub program: &'static str,
    pub hooks: &'static [&'static str],
    pub policy: AttachPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachStatus {
    Attached,
    /// The hook does not exist on the running kernel
    NotFound,
}

/// Binds programs to named kernel hooks
pub trait ProbeAttacher {
    /// Attach `program` to `hook`
    ///
    /// # Errors
    /// Returns [`AttachError`] when the hook exists but attaching failed
    fn attach(&mut self, program: &'static str, hook: &str) -> Result<AttachStatus, AttachError>;

    /// Detach every link of `program`
    ///
    /// # Errors
    /// Returns [`AttachError`] when the kernel refuses the detach
    fn detach(&mut self, program: &'static str) -> Result<(), AttachError>;
}

/// Outcome of an attach plan
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AttachReport {
    /// `(program, hook)` pairs that were bound
    pub attached: Vec<(&'static str, &'static str)>,
    /// Programs with no usable hook
    pub omitted: Vec<&'static str>,
}

impl AttachReport {
    #[must_use]
    pub fn hook_for(&self, program: &str) -> Option<&'static str> {
        self.attached.iter().find(|(p, _)| *p == program).map(|(_, hook)| *hook)
    }

    /// Distinct programs with at least one link
    #[must_use]
    pub fn programs(&self) -> Vec<&'static str> {
        let mut programs: Vec<_> = Vec::new();
        for (program, _) in &self.attached {
            if !programs.contains(program) {
                programs.push(*program);
            }
        }
        programs
    }
}

/// Attach every spec in order, falling back through its candidate hooks
pub fn attach_plan(attacher: &mut impl ProbeAttacher, specs: &[ProbeSpec]) -> AttachReport {
    let mut report = AttachReport::default();

    for spec in specs {
        let mut bound = false;
        for &hook in spec.hooks {
            match attacher.attach(spec.program, hook) {
                Ok(AttachStatus::Attached) => {
                    info!("✓ Attached kprobe: {} → {hook}", spec.program);
                    report.attached.push((spec.program, hook));
                    bound = true;
                    if spec.policy == AttachPolicy::FirstAvailable {
                        break;
                    }
                }
                Ok(AttachStatus::NotFound) => debug!("{hook} not present, trying next hook"),
                Err(e) => warn!("⚠️  {e}"),
            }
        }

        if !bound {
            let err = AttachError::HookNotFound {
                program: spec.program,
                candidates: spec.hooks.join(", "),
            };
            warn!("⚠️  {err}; {} omitted", spec.program);
            report.omitted.push(spec.program);
        }
    }

    report
}

/// Detach everything an attach plan bound
pub fn detach_all(attacher: &mut impl ProbeAttacher, report: &AttachReport) {
    for program in report.programs() {
        if let Err(e) = attacher.detach(program) {
            warn!("⚠️  {e}");
        }
    }
}

/// Function names exported by the running kernel
#[derive(Debug, Default)]
pub struct KernelSymbols {
    names: HashSet<String>,
}

impl KernelSymbols {
    /// Read `/proc/kallsyms`
    ///
    /// # Errors
    /// Returns [`AttachError::Kallsyms`] when the file cannot be read
    pub fn load() -> Result<Self, AttachError> {
        let file = std::fs::File::open("/proc/kallsyms").map_err(AttachError::Kallsyms)?;
        Self::from_reader(BufReader::new(file)).map_err(AttachError::Kallsyms)
    }

    /// Parse `address type name [module]` lines
    ///
    /// # Errors
    /// Propagates read errors from `reader`
    pub fn from_reader(reader: impl BufRead) -> std::io::Result<Self> {
        let mut names = HashSet::new();
        for line in reader.lines() {
            let line = line?;
            if let Some(name) = line.split_whitespace().nth(2) {
                names.insert(name.to_string());
            }
        }
        Ok(Self { names })
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// [`ProbeAttacher`] backed by a loaded eBPF object
pub struct EbpfAttacher<'a> {
    bpf: &'a mut Ebpf,
    symbols: KernelSymbols,
    loaded: HashSet<&'static str>,
    links: HashMap<&'static str, Vec<KProbeLinkId>>,
}

impl<'a> EbpfAttacher<'a> {
    #[must_use]
    pub fn new(bpf: &'a mut Ebpf, symbols: KernelSymbols) -> Self {
        Self { bpf, symbols, loaded: HashSet::new(), links: HashMap::new() }
    }

    fn kprobe(&mut self, program: &'static str) -> Result<&mut KProbe, AttachError> {
        let kprobe: &mut KProbe = self
            .bpf
            .program_mut(program)
            .ok_or(AttachError::ProgramNotFound(program))?
            .try_into()
            .map_err(|e: aya::programs::ProgramError| AttachError::AttachFailed {
                program,
                hook: String::new(),
                error: e.to_string(),
            })?;

        if !self.loaded.contains(program) {
            kprobe.load().map_err(|e| AttachError::AttachFailed {
                program,
                hook: String::new(),
                error: format!("load failed: {e}"),
            })?;
            self.loaded.insert(program);
        }
        Ok(kprobe)
    }
}

impl ProbeAttacher for EbpfAttacher<'_> {
    fn attach(&mut self, program: &'static str, hook: &str) -> Result<AttachStatus, AttachError> {
        if !self.symbols.contains(hook) {
            return Ok(AttachStatus::NotFound);
        }

        let link = self.kprobe(program)?.attach(hook, 0).map_err(|e| AttachError::AttachFailed {
            program,
            hook: hook.to_string(),
            error: e.to_string(),
        })?;
        self.links.entry(program).or_default().push(link);
        Ok(AttachStatus::Attached)
    }

    fn detach(&mut self, program: &'static str) -> Result<(), AttachError> {
        let links = self.links.remove(program).unwrap_or_default();
        let kprobe = self.kprobe(program)?;
        for link in links {
            kprobe.detach(link).map_err(|e| AttachError::AttachFailed {
                program,
                hook: String::new(),
                error: format!("detach failed: {e}"),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kallsyms() {
        let text = "\
ffffffff81000000 T _stext
ffffffff8145a2b0 T submit_bio
ffffffff8145c9e0 t bio_attempt_back_merge
ffffffffc0a01000 t ext4_sync_file\t[ext4]
";
        let symbols = KernelSymbols::from_reader(text.as_bytes()).unwrap();
        assert_eq!(symbols.len(), 4);
        assert!(symbols.contains("submit_bio"));
        assert!(symbols.contains("ext4_sync_file"));
        assert!(!symbols.contains("generic_make_request"));
    }

    #[test]
    fn test_report_programs_are_distinct() {
        let report = AttachReport {
            attached: vec![
                ("merge_return", "bio_attempt_front_merge"),
                ("merge_return", "bio_attempt_back_merge"),
                ("rq_done", "__blk_account_io_done"),
            ],
            omitted: vec![],
        };
        assert_eq!(report.programs(), vec!["merge_return", "rq_done"]);
        assert_eq!(report.hook_for("rq_done"), Some("__blk_account_io_done"));
        assert_eq!(report.hook_for("rq_issue"), None);
    }
}
