//! Category search, resonance and learning.
//!
//! One call to [`ResonanceSearch::present`] runs the whole cycle for one input:
//!
//! ```text
//! SEARCHING --match >= vigilance--> RESONATING          (learn on the candidate)
//!     |
//!     +--candidates or iteration budget exhausted--> EXHAUSTED --> NEW_CATEGORY
//!                                                          \-> REJECTED (Reject policy, full)
//! ```
//!
//! Candidates are committed categories in index order. A candidate that fails
//! the vigilance test is suppressed for the rest of this presentation only: the
//! suppressed set lives in a [`SearchContext`] built fresh for every input and
//! dropped once a decision is reached.
//!
//! Templates are owned here and change in exactly one place, [`ResonanceSearch::present`]'s
//! commit step, at most once per presentation.

use std::collections::HashSet;
use std::io::{self, Read, Write};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use tracing::{debug, trace, warn};

use crate::error::{ArtError, Result};
use crate::pattern::Activation;
use crate::storage;

pub type CategoryId = usize;

/// What to do when every slot is committed and nothing resonated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ExhaustionPolicy {
    /// Reset the last slot to uncommitted and learn the input into it.
    ///
    /// This overwrites whatever that slot had learned.
    #[default]
    ReuseLast,
    /// Leave every template alone and report no category.
    Reject,
}

impl ExhaustionPolicy {
    fn tag(self) -> u8 {
        match self {
            ExhaustionPolicy::ReuseLast => 0,
            ExhaustionPolicy::Reject => 1,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ExhaustionPolicy::ReuseLast),
            1 => Some(ExhaustionPolicy::Reject),
            _ => None,
        }
    }
}

/// Search/learning parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SearchConfig {
    /// Match threshold in [0, 1]. Higher gives more, finer categories.
    pub vigilance: f64,
    /// Step size of the template update, in (0, 1].
    pub learning_rate: f64,
    /// Committed candidates evaluated before the search gives up.
    pub max_search_iterations: usize,
    pub exhaustion: ExhaustionPolicy,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            vigilance: 0.75,
            learning_rate: 0.5,
            max_search_iterations: 64,
            exhaustion: ExhaustionPolicy::ReuseLast,
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.vigilance) {
            return Err(ArtError::config("vigilance", "must be in [0, 1]"));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            return Err(ArtError::config("learning_rate", "must be in (0, 1]"));
        }
        if self.max_search_iterations == 0 {
            return Err(ArtError::config("max_search_iterations", "must be >= 1"));
        }
        Ok(())
    }
}

/// Position of a presentation in the search state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SearchState {
    Searching,
    /// An existing category passed the vigilance test.
    Resonating,
    /// No committed candidate passed; waiting on the exhaustion policy.
    Exhausted,
    /// A fresh (or recycled) slot took the input.
    NewCategory,
    /// Every slot committed and the policy is [`ExhaustionPolicy::Reject`].
    Rejected,
}

/// Per-presentation search bookkeeping.
///
/// Built empty for each input and consumed by the decision; it cannot outlive
/// the presentation it belongs to.
#[derive(Debug, Clone)]
pub struct SearchContext {
    suppressed: HashSet<CategoryId>,
    evaluated: Vec<CategoryId>,
    best: Option<(CategoryId, f64)>,
    state: SearchState,
}

impl SearchContext {
    fn new() -> Self {
        Self {
            suppressed: HashSet::new(),
            evaluated: Vec::new(),
            best: None,
            state: SearchState::Searching,
        }
    }

    pub fn is_suppressed(&self, id: CategoryId) -> bool {
        self.suppressed.contains(&id)
    }

    /// Candidates evaluated so far.
    pub fn iterations(&self) -> usize {
        self.evaluated.len()
    }

    pub fn state(&self) -> SearchState {
        self.state
    }

    fn record(&mut self, id: CategoryId, score: f64) {
        self.evaluated.push(id);
        if self.best.map_or(true, |(_, s)| score > s) {
            self.best = Some((id, score));
        }
    }

    fn suppress(&mut self, id: CategoryId) {
        self.suppressed.insert(id);
    }
}

/// Decision reached by the search, before any template changes.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Decision {
    Resonate { id: CategoryId, score: f64 },
    Allocate { id: CategoryId },
    Recycle { id: CategoryId },
    Reject { best: f64 },
}

/// Result of presenting one input.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SearchOutcome {
    /// Selected category, `None` only when rejected.
    pub category: Option<CategoryId>,
    /// Match score of the selected category; best score seen when rejected.
    pub match_score: f64,
    pub resonated: bool,
    /// Terminal state: `Resonating`, `NewCategory` or `Rejected`.
    pub state: SearchState,
    /// Committed candidates evaluated, in order.
    pub evaluated: Vec<CategoryId>,
    /// A new slot was committed.
    pub created: bool,
    /// A committed template was overwritten by the exhaustion policy.
    pub overwrote: bool,
}

impl SearchOutcome {
    pub fn iterations(&self) -> usize {
        self.evaluated.len()
    }
}

/// ART match: `sum(min(input, expectation)) / sum(input)`, clamped to [0, 1].
///
/// Fuzzy ART is defined on non-negative inputs, so negative entries (a shunting
/// layer with a negative floor can produce them) count as zero. An input with no
/// positive entry has nothing to mismatch and scores 1.0.
pub fn match_score(input: &[Activation], expectation: &[Activation]) -> f64 {
    let norm: f64 = input.iter().map(|i| i.max(0.0)).sum();
    if norm <= 0.0 {
        return 1.0;
    }
    let overlap: f64 = input
        .iter()
        .zip(expectation)
        .map(|(i, e)| i.max(0.0).min(*e))
        .sum();
    (overlap / norm).clamp(0.0, 1.0)
}

/// The category store and search controller.
#[derive(Debug, Clone)]
pub struct ResonanceSearch {
    cfg: SearchConfig,
    dimension: usize,
    capacity: usize,
    /// Committed templates; index is the category id. Slots past the end are
    /// uncommitted.
    templates: Vec<Vec<Activation>>,
}

impl ResonanceSearch {
    /// Upper bound on the template dimension.
    pub const MAX_DIMENSION: usize = 1 << 20;
    /// Upper bound on the number of category slots.
    pub const MAX_CAPACITY: usize = 1 << 20;

    pub fn new(dimension: usize, capacity: usize, cfg: SearchConfig) -> Result<Self> {
        if dimension == 0 || dimension > Self::MAX_DIMENSION {
            return Err(ArtError::config("input_size", "out of range"));
        }
        if capacity == 0 || capacity > Self::MAX_CAPACITY {
            return Err(ArtError::config("category_capacity", "out of range"));
        }
        cfg.validate()?;
        Ok(Self {
            cfg,
            dimension,
            capacity,
            templates: Vec::new(),
        })
    }

    pub fn config(&self) -> &SearchConfig {
        &self.cfg
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of committed categories.
    pub fn committed(&self) -> usize {
        self.templates.len()
    }

    pub fn is_committed(&self, id: CategoryId) -> bool {
        id < self.templates.len()
    }

    /// Learned template of a committed category.
    pub fn template(&self, id: CategoryId) -> Option<&[Activation]> {
        self.templates.get(id).map(Vec::as_slice)
    }

    pub fn templates(&self) -> impl Iterator<Item = &[Activation]> + '_ {
        self.templates.iter().map(Vec::as_slice)
    }

    /// Top-down expectation read out by category `id`.
    ///
    /// Uncommitted slots expect nothing in particular: all ones.
    pub fn expectation(&self, id: CategoryId) -> Option<Vec<Activation>> {
        if id >= self.capacity {
            return None;
        }
        Some(match self.templates.get(id) {
            Some(t) => t.clone(),
            None => vec![1.0; self.dimension],
        })
    }

    /// Match of `input` against category `id`. Uncommitted slots match anything.
    pub fn match_against(&self, id: CategoryId, input: &[Activation]) -> f64 {
        match self.templates.get(id) {
            Some(t) => match_score(input, t),
            None => 1.0,
        }
    }

    /// True when `score` fails the vigilance test.
    #[inline]
    pub fn should_reset(&self, score: f64) -> bool {
        score < self.cfg.vigilance
    }

    /// Change search parameters. Templates are kept.
    pub fn set_config(&mut self, cfg: SearchConfig) -> Result<()> {
        cfg.validate()?;
        self.cfg = cfg;
        Ok(())
    }

    /// Grow or shrink capacity. Shrinking below the committed count is refused.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        if capacity == 0 || capacity > Self::MAX_CAPACITY {
            return Err(ArtError::config("category_capacity", "out of range"));
        }
        if capacity < self.templates.len() {
            return Err(ArtError::IllegalState(
                "capacity below committed category count",
            ));
        }
        self.capacity = capacity;
        Ok(())
    }

    /// Forget every learned category.
    pub fn clear(&mut self) {
        self.templates.clear();
    }

    /// Run search, decision and learning for one input.
    pub fn present(&mut self, input: &[Activation]) -> Result<SearchOutcome> {
        if input.len() != self.dimension {
            return Err(ArtError::DimensionMismatch {
                expected: self.dimension,
                got: input.len(),
                index: 0,
            });
        }

        let mut ctx = SearchContext::new();
        let decision = self.search(input, &mut ctx);
        Ok(self.commit(decision, input, ctx))
    }

    /// Walk committed candidates in index order. Read-only.
    fn search(&self, input: &[Activation], ctx: &mut SearchContext) -> Decision {
        for id in 0..self.templates.len() {
            if ctx.iterations() >= self.cfg.max_search_iterations {
                break;
            }
            if ctx.is_suppressed(id) {
                continue;
            }

            let score = match_score(input, &self.templates[id]);
            ctx.record(id, score);
            trace!(category = id, score, "candidate");

            if !self.should_reset(score) {
                ctx.state = SearchState::Resonating;
                return Decision::Resonate { id, score };
            }
            ctx.suppress(id);
        }

        ctx.state = SearchState::Exhausted;
        if self.templates.len() < self.capacity {
            return Decision::Allocate {
                id: self.templates.len(),
            };
        }
        match self.cfg.exhaustion {
            ExhaustionPolicy::ReuseLast => Decision::Recycle {
                id: self.capacity - 1,
            },
            ExhaustionPolicy::Reject => Decision::Reject {
                best: ctx.best.map_or(0.0, |(_, s)| s),
            },
        }
    }

    /// Apply the decision: the only place templates change.
    fn commit(
        &mut self,
        decision: Decision,
        input: &[Activation],
        ctx: SearchContext,
    ) -> SearchOutcome {
        let evaluated = ctx.evaluated;
        match decision {
            Decision::Resonate { id, score } => {
                self.learn(id, input);
                debug!(category = id, score, iterations = evaluated.len(), "resonance");
                SearchOutcome {
                    category: Some(id),
                    match_score: score,
                    resonated: true,
                    state: SearchState::Resonating,
                    evaluated,
                    created: false,
                    overwrote: false,
                }
            }
            Decision::Allocate { id } => {
                self.templates.push(vec![1.0; self.dimension]);
                self.learn(id, input);
                debug!(category = id, iterations = evaluated.len(), "new category");
                SearchOutcome {
                    category: Some(id),
                    match_score: 1.0,
                    resonated: true,
                    state: SearchState::NewCategory,
                    evaluated,
                    created: true,
                    overwrote: false,
                }
            }
            Decision::Recycle { id } => {
                warn!(
                    category = id,
                    "all category slots committed; overwriting last template"
                );
                self.templates[id].fill(1.0);
                self.learn(id, input);
                SearchOutcome {
                    category: Some(id),
                    match_score: 1.0,
                    resonated: true,
                    state: SearchState::NewCategory,
                    evaluated,
                    created: false,
                    overwrote: true,
                }
            }
            Decision::Reject { best } => {
                debug!(best, iterations = evaluated.len(), "rejected");
                SearchOutcome {
                    category: None,
                    match_score: best,
                    resonated: false,
                    state: SearchState::Rejected,
                    evaluated,
                    created: false,
                    overwrote: false,
                }
            }
        }
    }

    /// `template <- template + rate * (input - template)`.
    fn learn(&mut self, id: CategoryId, input: &[Activation]) {
        let rate = self.cfg.learning_rate;
        for (t, i) in self.templates[id].iter_mut().zip(input) {
            *t += rate * (i - *t);
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Save search parameters and every committed template.
    pub fn save_image_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(storage::MAGIC)?;
        storage::write_u32_le(w, storage::VERSION_CURRENT)?;
        self.write_cfg_chunk(w)?;
        self.write_template_chunk(w)?;
        Ok(())
    }

    pub fn save_image_bytes(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.image_size_bytes()?);
        self.save_image_to(&mut buf)?;
        Ok(buf)
    }

    pub fn image_size_bytes(&self) -> io::Result<usize> {
        let mut counter = storage::CountingWriter::new();
        self.save_image_to(&mut counter)?;
        Ok(counter.written())
    }

    fn write_cfg_chunk<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut payload = Vec::with_capacity(33);
        storage::write_u32_le(&mut payload, storage::len_u32(self.dimension)?)?;
        storage::write_u32_le(&mut payload, storage::len_u32(self.capacity)?)?;
        storage::write_f64_le(&mut payload, self.cfg.vigilance)?;
        storage::write_f64_le(&mut payload, self.cfg.learning_rate)?;
        storage::write_u32_le(
            &mut payload,
            storage::len_u32(self.cfg.max_search_iterations)?,
        )?;
        storage::write_u8(&mut payload, self.cfg.exhaustion.tag())?;
        storage::write_chunk_lz4(w, *b"CFG0", &payload)
    }

    fn write_template_chunk<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut payload = Vec::with_capacity(4 + self.templates.len() * self.dimension * 8);
        storage::write_u32_le(&mut payload, storage::len_u32(self.templates.len())?)?;
        for t in &self.templates {
            for v in t {
                storage::write_f64_le(&mut payload, *v)?;
            }
        }
        storage::write_chunk_lz4(w, *b"TMPL", &payload)
    }

    /// Load an image written by [`ResonanceSearch::save_image_to`].
    ///
    /// Unknown chunks are skipped for forward-compatibility. The config chunk is
    /// validated before any template is read, and templates must fit the
    /// declared dimension and capacity exactly and hold finite values.
    pub fn load_image_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let magic = storage::read_exact::<8, _>(r)?;
        if &magic != storage::MAGIC {
            return Err(invalid("bad template image magic"));
        }
        let version = storage::read_u32_le(r)?;
        if version != storage::VERSION_CURRENT {
            return Err(invalid("unsupported template image version"));
        }

        let mut search: Option<ResonanceSearch> = None;
        let mut templates: Option<Vec<Vec<Activation>>> = None;

        loop {
            let (tag, len) = match storage::read_chunk_header(r) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            };
            match &tag {
                b"CFG0" => {
                    let payload = storage::read_chunk_payload(r, len)?;
                    let (dimension, capacity, cfg) =
                        Self::read_cfg_payload(&mut io::Cursor::new(payload))?;
                    search = Some(
                        ResonanceSearch::new(dimension, capacity, cfg)
                            .map_err(|_| invalid("invalid search config in image"))?,
                    );
                }
                b"TMPL" => {
                    let payload = storage::read_chunk_payload(r, len)?;
                    let header = search
                        .as_ref()
                        .ok_or_else(|| invalid("template chunk before config chunk"))?;
                    templates = Some(Self::read_template_payload(
                        &payload,
                        header.dimension,
                        header.capacity,
                    )?);
                }
                _ => storage::skip_chunk(r, len)?,
            }
        }

        let mut search = search.ok_or_else(|| invalid("missing config chunk"))?;
        search.templates = templates.unwrap_or_default();
        Ok(search)
    }

    pub fn load_image_bytes(bytes: &[u8]) -> io::Result<Self> {
        Self::load_image_from(&mut io::Cursor::new(bytes))
    }

    fn read_cfg_payload<R: Read>(r: &mut R) -> io::Result<(usize, usize, SearchConfig)> {
        let dimension = storage::read_u32_le(r)? as usize;
        let capacity = storage::read_u32_le(r)? as usize;
        let vigilance = storage::read_f64_le(r)?;
        let learning_rate = storage::read_f64_le(r)?;
        let max_search_iterations = storage::read_u32_le(r)? as usize;
        let exhaustion = ExhaustionPolicy::from_tag(storage::read_u8(r)?)
            .ok_or_else(|| invalid("unknown exhaustion policy"))?;
        Ok((
            dimension,
            capacity,
            SearchConfig {
                vigilance,
                learning_rate,
                max_search_iterations,
                exhaustion,
            },
        ))
    }

    /// `dimension` and `capacity` come from an already validated config chunk.
    fn read_template_payload(
        payload: &[u8],
        dimension: usize,
        capacity: usize,
    ) -> io::Result<Vec<Vec<Activation>>> {
        let mut r = io::Cursor::new(payload);
        let count = storage::read_u32_le(&mut r)? as usize;
        if count > capacity {
            return Err(invalid("more templates than capacity"));
        }
        let expected_len = count
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(8))
            .and_then(|n| n.checked_add(4));
        if expected_len != Some(payload.len()) {
            return Err(invalid("template chunk size does not match its header"));
        }

        let mut templates = Vec::with_capacity(count);
        for _ in 0..count {
            let mut t = Vec::with_capacity(dimension);
            for _ in 0..dimension {
                let v = storage::read_f64_le(&mut r)?;
                if !v.is_finite() {
                    return Err(invalid("non-finite template value"));
                }
                t.push(v);
            }
            templates.push(t);
        }
        Ok(templates)
    }
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
