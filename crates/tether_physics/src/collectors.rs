//! Query result collectors
//!
//! The engine reports candidate hits one at a time and asks whether to keep
//! going. A [`CollisionCollector`] decides what to keep, and publishes an
//! early-out fraction: hits at or beyond it cannot improve the result and
//! are skipped before they reach [`CollisionCollector::add_hit`].

/// Anything a collector can rank
pub trait CollectedHit {
    /// Position of the hit along the query (ray/sweep parameter, or
    /// negative penetration depth for overlaps); smaller is closer
    fn fraction(&self) -> f32;
}

impl CollectedHit for f32 {
    fn fraction(&self) -> f32 {
        *self
    }
}

/// Accumulation strategy driven by a query
pub trait CollisionCollector<H> {
    fn add_hit(&mut self, hit: H);

    /// Hits with a fraction at or past this are not worth reporting
    fn early_out_fraction(&self) -> f32 {
        f32::MAX
    }

    /// True once the query should stop visiting candidates
    fn should_early_out(&self) -> bool {
        self.early_out_fraction() <= f32::MIN
    }

    /// Whether a candidate at `fraction` can still change the result
    fn accepts(&self, fraction: f32) -> bool {
        fraction < self.early_out_fraction()
    }

    /// Forget every hit, keeping allocations
    fn reset(&mut self);

    fn hit_count(&self) -> usize;

    fn had_hit(&self) -> bool {
        self.hit_count() > 0
    }

    /// Panics if `index >= hit_count()`
    fn get_hit(&self, index: usize) -> &H;

    /// Move the hits out, leaving the collector empty
    fn take_hits(&mut self) -> Vec<H>;
}

// ==================== All ====================

/// Keeps every hit, in arrival order
#[derive(Debug, Clone)]
pub struct AllHitsCollector<H> {
    hits: Vec<H>,
}

impl<H> Default for AllHitsCollector<H> {
    fn default() -> Self {
        Self { hits: Vec::new() }
    }
}

impl<H> AllHitsCollector<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Order hits by fraction, closest first
    pub fn sort(&mut self)
    where
        H: CollectedHit,
    {
        self.hits.sort_by(|a, b| a.fraction().total_cmp(&b.fraction()));
    }
}

impl<H> CollisionCollector<H> for AllHitsCollector<H> {
    fn add_hit(&mut self, hit: H) {
        self.hits.push(hit);
    }

    fn reset(&mut self) {
        self.hits.clear();
    }

    fn hit_count(&self) -> usize {
        self.hits.len()
    }

    fn get_hit(&self, index: usize) -> &H {
        &self.hits[index]
    }

    fn take_hits(&mut self) -> Vec<H> {
        std::mem::take(&mut self.hits)
    }
}

// ==================== Any ====================

/// Stops at the first hit
#[derive(Debug, Clone)]
pub struct AnyHitCollector<H> {
    hit: Option<H>,
}

impl<H> Default for AnyHitCollector<H> {
    fn default() -> Self {
        Self { hit: None }
    }
}

impl<H> AnyHitCollector<H> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<H> CollisionCollector<H> for AnyHitCollector<H> {
    fn add_hit(&mut self, hit: H) {
        if self.hit.is_none() {
            self.hit = Some(hit);
        }
    }

    fn early_out_fraction(&self) -> f32 {
        if self.hit.is_some() {
            f32::MIN
        } else {
            f32::MAX
        }
    }

    fn reset(&mut self) {
        self.hit = None;
    }

    fn hit_count(&self) -> usize {
        self.hit.is_some() as usize
    }

    fn get_hit(&self, index: usize) -> &H {
        match (&self.hit, index) {
            (Some(hit), 0) => hit,
            _ => panic!("hit index {} out of bounds ({} hits)", index, self.hit_count()),
        }
    }

    fn take_hits(&mut self) -> Vec<H> {
        self.hit.take().into_iter().collect()
    }
}

// ==================== Closest ====================

/// Keeps the single closest hit and tightens the early out to it
#[derive(Debug, Clone)]
pub struct ClosestHitCollector<H> {
    hit: Option<H>,
    early_out: f32,
}

impl<H> Default for ClosestHitCollector<H> {
    fn default() -> Self {
        Self {
            hit: None,
            early_out: f32::MAX,
        }
    }
}

impl<H> ClosestHitCollector<H> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<H: CollectedHit> CollisionCollector<H> for ClosestHitCollector<H> {
    fn add_hit(&mut self, hit: H) {
        let fraction = hit.fraction();
        if fraction < self.early_out {
            self.early_out = fraction;
            self.hit = Some(hit);
        }
    }

    fn early_out_fraction(&self) -> f32 {
        self.early_out
    }

    fn reset(&mut self) {
        self.hit = None;
        self.early_out = f32::MAX;
    }

    fn hit_count(&self) -> usize {
        self.hit.is_some() as usize
    }

    fn get_hit(&self, index: usize) -> &H {
        match (&self.hit, index) {
            (Some(hit), 0) => hit,
            _ => panic!("hit index {} out of bounds ({} hits)", index, self.hit_count()),
        }
    }

    fn take_hits(&mut self) -> Vec<H> {
        self.early_out = f32::MAX;
        self.hit.take().into_iter().collect()
    }
}

// ==================== Closest N ====================

/// Keeps up to `max_hits` hits, ordered closest first
#[derive(Debug, Clone)]
pub struct ClosestNHitsCollector<H> {
    hits: Vec<H>,
    max_hits: usize,
    early_out: f32,
}

impl<H> ClosestNHitsCollector<H> {
    pub fn new(max_hits: usize) -> Self {
        let max_hits = max_hits.max(1);
        Self {
            hits: Vec::with_capacity(max_hits + 1),
            max_hits,
            early_out: f32::MAX,
        }
    }

    pub fn max_hits(&self) -> usize {
        self.max_hits
    }
}

impl<H: CollectedHit> CollisionCollector<H> for ClosestNHitsCollector<H> {
    fn add_hit(&mut self, hit: H) {
        let fraction = hit.fraction();
        if fraction >= self.early_out {
            return;
        }

        // Insert after equal fractions so arrival order breaks ties.
        let at = self.hits.partition_point(|kept| kept.fraction() <= fraction);
        self.hits.insert(at, hit);

        if self.hits.len() > self.max_hits {
            self.hits.truncate(self.max_hits);
        }
        if self.hits.len() == self.max_hits {
            if let Some(worst) = self.hits.last() {
                self.early_out = worst.fraction();
            }
        }
    }

    fn early_out_fraction(&self) -> f32 {
        self.early_out
    }

    fn reset(&mut self) {
        self.hits.clear();
        self.early_out = f32::MAX;
    }

    fn hit_count(&self) -> usize {
        self.hits.len()
    }

    fn get_hit(&self, index: usize) -> &H {
        &self.hits[index]
    }

    fn take_hits(&mut self) -> Vec<H> {
        self.early_out = f32::MAX;
        std::mem::take(&mut self.hits)
    }
}

// ==================== Strategy ====================

/// Collector choice exposed to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectStrategy {
    #[default]
    Closest,
    Any,
    All,
    ClosestN(usize),
}

impl CollectStrategy {
    pub fn collector<H: CollectedHit>(self) -> StrategyCollector<H> {
        match self {
            Self::Closest => StrategyCollector::Closest(ClosestHitCollector::new()),
            Self::Any => StrategyCollector::Any(AnyHitCollector::new()),
            Self::All => StrategyCollector::All(AllHitsCollector::new()),
            Self::ClosestN(n) => StrategyCollector::ClosestN(ClosestNHitsCollector::new(n)),
        }
    }
}

/// One of the four collectors, picked at runtime
#[derive(Debug, Clone)]
pub enum StrategyCollector<H> {
    Closest(ClosestHitCollector<H>),
    Any(AnyHitCollector<H>),
    All(AllHitsCollector<H>),
    ClosestN(ClosestNHitsCollector<H>),
}

macro_rules! dispatch {
    ($self:expr, $collector:ident => $body:expr) => {
        match $self {
            StrategyCollector::Closest($collector) => $body,
            StrategyCollector::Any($collector) => $body,
            StrategyCollector::All($collector) => $body,
            StrategyCollector::ClosestN($collector) => $body,
        }
    };
}

impl<H: CollectedHit> CollisionCollector<H> for StrategyCollector<H> {
    fn add_hit(&mut self, hit: H) {
        dispatch!(self, c => c.add_hit(hit))
    }

    fn early_out_fraction(&self) -> f32 {
        dispatch!(self, c => c.early_out_fraction())
    }

    fn reset(&mut self) {
        dispatch!(self, c => c.reset())
    }

    fn hit_count(&self) -> usize {
        dispatch!(self, c => c.hit_count())
    }

    fn get_hit(&self, index: usize) -> &H {
        dispatch!(self, c => c.get_hit(index))
    }

    fn take_hits(&mut self) -> Vec<H> {
        dispatch!(self, c => c.take_hits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRACTIONS: [f32; 5] = [0.7, 0.2, 0.9, 0.1, 0.5];

    /// Feed hits the way a query does: skip what the collector rejects
    fn run<C: CollisionCollector<f32>>(collector: &mut C, fractions: &[f32]) -> usize {
        let mut visited = 0;
        for &fraction in fractions {
            if collector.should_early_out() {
                break;
            }
            visited += 1;
            if collector.accepts(fraction) {
                collector.add_hit(fraction);
            }
        }
        visited
    }

    fn hits<C: CollisionCollector<f32>>(collector: &C) -> Vec<f32> {
        (0..collector.hit_count()).map(|i| *collector.get_hit(i)).collect()
    }

    #[test]
    fn test_closest_n_ordering() {
        let mut collector = ClosestNHitsCollector::new(3);
        run(&mut collector, &FRACTIONS);
        assert_eq!(hits(&collector), vec![0.1, 0.2, 0.5]);
        assert_eq!(collector.early_out_fraction(), 0.5);
    }

    #[test]
    fn test_closest_n_keeps_late_better_hit() {
        let mut collector = ClosestNHitsCollector::new(2);
        collector.add_hit(0.4);
        collector.add_hit(0.6);
        // Full; a better hit arriving late displaces the worst.
        collector.add_hit(0.1);
        assert_eq!(hits(&collector), vec![0.1, 0.4]);
        collector.add_hit(0.4);
        assert_eq!(hits(&collector), vec![0.1, 0.4]);
    }

    #[test]
    fn test_closest_tightens() {
        let mut collector = ClosestHitCollector::new();
        run(&mut collector, &FRACTIONS);
        assert_eq!(hits(&collector), vec![0.1]);
        assert_eq!(collector.early_out_fraction(), 0.1);
        assert!(!collector.accepts(0.1));
        assert!(collector.accepts(0.05));
    }

    #[test]
    fn test_any_stops_at_first() {
        let mut collector = AnyHitCollector::new();
        let visited = run(&mut collector, &FRACTIONS);
        assert_eq!(visited, 1);
        assert_eq!(hits(&collector), vec![0.7]);
        assert!(collector.should_early_out());
    }

    #[test]
    fn test_all_never_early_outs() {
        let mut collector = AllHitsCollector::new();
        let visited = run(&mut collector, &FRACTIONS);
        assert_eq!(visited, FRACTIONS.len());
        assert_eq!(hits(&collector), FRACTIONS.to_vec());

        collector.sort();
        assert_eq!(hits(&collector), vec![0.1, 0.2, 0.5, 0.7, 0.9]);
    }

    #[test]
    fn test_negative_fractions_are_accepted() {
        let mut collector = ClosestHitCollector::new();
        collector.add_hit(-0.3);
        collector.add_hit(-0.1);
        assert_eq!(hits(&collector), vec![-0.3]);
    }

    #[test]
    fn test_reset_reuses() {
        let strategies = [
            CollectStrategy::Closest,
            CollectStrategy::Any,
            CollectStrategy::All,
            CollectStrategy::ClosestN(2),
        ];
        for strategy in strategies {
            let mut collector = strategy.collector::<f32>();
            run(&mut collector, &FRACTIONS);
            assert!(collector.had_hit());

            collector.reset();
            assert!(!collector.had_hit());
            assert_eq!(collector.hit_count(), 0);
            assert_eq!(collector.early_out_fraction(), f32::MAX);

            run(&mut collector, &[0.3]);
            assert_eq!(hits(&collector), vec![0.3]);
        }
    }

    #[test]
    fn test_take_hits_empties() {
        let mut collector = CollectStrategy::ClosestN(3).collector::<f32>();
        run(&mut collector, &FRACTIONS);
        assert_eq!(collector.take_hits(), vec![0.1, 0.2, 0.5]);
        assert!(!collector.had_hit());
    }

    #[test]
    #[should_panic]
    fn test_get_hit_out_of_bounds() {
        let collector = ClosestHitCollector::<f32>::new();
        collector.get_hit(0);
    }
}
