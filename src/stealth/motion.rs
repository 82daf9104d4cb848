//! Synthetic pointer motion
//!
//! Pointer paths are a handful of interpolated points with small pauses in
//! between, and clicks are a press/release pair slightly off-centre with a
//! realistic hold time.

use smallvec::SmallVec;

use super::timing::{random_f64_range, random_range};
use crate::driver::{BoundingBox, PageDriver, Point, PointerEvent};
use crate::error::Result;
use crate::pacer::Pacer;

/// Stack-allocated storage for typical pointer paths
pub type PointVec = SmallVec<[Point; 16]>;

/// Fewest interpolation steps of a move
pub const MIN_STEPS: usize = 5;
/// Random extra steps added on top, exclusive upper bound
pub const EXTRA_STEPS: u64 = 10;

/// `steps + 1` points evenly spaced from just past `origin` to `target`
pub fn linear_path(origin: Point, target: Point, steps: usize) -> PointVec {
    let steps = steps.max(1);
    let segments = (steps + 1) as f64;
    (1..=steps + 1)
        .map(|i| {
            let t = i as f64 / segments;
            (
                origin.0 + (target.0 - origin.0) * t,
                origin.1 + (target.1 - origin.1) * t,
            )
        })
        .collect()
}

/// Emits pointer trajectories and clicks, tracking where the cursor is
#[derive(Debug, Clone)]
pub struct MotionSimulator {
    cursor: Point,
}

impl Default for MotionSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl MotionSimulator {
    /// Simulator with the cursor somewhere in the upper viewport
    pub fn new() -> Self {
        Self::at((random_f64_range(100.0, 800.0), random_f64_range(100.0, 600.0)))
    }

    pub fn at(cursor: Point) -> Self {
        Self { cursor }
    }

    pub fn cursor(&self) -> Point {
        self.cursor
    }

    fn random_steps() -> usize {
        MIN_STEPS + random_range(0, EXTRA_STEPS) as usize
    }

    /// Move from `origin` to the centre of `target`; returns points emitted
    pub async fn move_to<D>(
        &mut self,
        driver: &D,
        pacer: &Pacer,
        target: &BoundingBox,
        origin: Point,
    ) -> Result<usize>
    where
        D: PageDriver + ?Sized,
    {
        self.move_to_point(driver, pacer, target.center(), origin)
            .await
    }

    async fn move_to_point<D>(
        &mut self,
        driver: &D,
        pacer: &Pacer,
        target: Point,
        origin: Point,
    ) -> Result<usize>
    where
        D: PageDriver + ?Sized,
    {
        let path = linear_path(origin, target, Self::random_steps());
        let last = path.len() - 1;

        for (i, &(x, y)) in path.iter().enumerate() {
            pacer
                .guard(driver.dispatch_pointer(PointerEvent::moved(x, y)))
                .await?;
            self.cursor = (x, y);
            if i < last {
                pacer.micro(20, 80).await?;
            }
        }

        Ok(path.len())
    }

    /// Move to the target from the current cursor and click it
    pub async fn click<D>(&mut self, driver: &D, pacer: &Pacer, target: &BoundingBox) -> Result<()>
    where
        D: PageDriver + ?Sized,
    {
        let origin = self.cursor;
        self.move_to(driver, pacer, target, origin).await?;

        pacer.micro(150, 400).await?;

        let (cx, cy) = target.center();
        let x = cx + random_f64_range(-5.0, 5.0);
        let y = cy + random_f64_range(-5.0, 5.0);

        pacer
            .guard(driver.dispatch_pointer(PointerEvent::pressed(x, y)))
            .await?;
        pacer.micro(50, 150).await?;
        pacer
            .guard(driver.dispatch_pointer(PointerEvent::released(x, y)))
            .await?;
        self.cursor = (x, y);

        pacer.micro(200, 500).await
    }

    /// A few small aimless moves around the cursor
    pub async fn idle_jitter<D>(&mut self, driver: &D, pacer: &Pacer) -> Result<()>
    where
        D: PageDriver + ?Sized,
    {
        for _ in 0..random_range(2, 5) {
            let (x, y) = self.cursor;
            let next = (
                (x + random_f64_range(-30.0, 30.0)).max(0.0),
                (y + random_f64_range(-30.0, 30.0)).max(0.0),
            );
            pacer
                .guard(driver.dispatch_pointer(PointerEvent::moved(next.0, next.1)))
                .await?;
            self.cursor = next;
            pacer.micro(40, 120).await?;
        }
        Ok(())
    }

    /// Scroll by roughly `delta_y` in several uneven wheel steps
    pub async fn scroll<D>(&mut self, driver: &D, pacer: &Pacer, delta_y: f64) -> Result<()>
    where
        D: PageDriver + ?Sized,
    {
        let steps = random_range(3, 8);
        let per_step = delta_y / steps as f64;

        for _ in 0..steps {
            let amount = per_step + random_f64_range(-20.0, 20.0);
            pacer.guard(driver.scroll_by(amount)).await?;
            pacer.micro(30, 100).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{PointerKind, SimulatedElement, SimulatedPage};
    use crate::stealth::TimingModel;
    use tokio_util::sync::CancellationToken;

    fn pacer() -> Pacer {
        Pacer::new(CancellationToken::new(), TimingModel::default(), 1.0)
    }

    #[test]
    fn test_linear_path_ends_on_target() {
        let path = linear_path((0.0, 0.0), (100.0, 50.0), 9);
        assert_eq!(path.len(), 10);
        let last = path.last().unwrap();
        assert!((last.0 - 100.0).abs() < 1e-9);
        assert!((last.1 - 50.0).abs() < 1e-9);
        let first = path.first().unwrap();
        assert!((first.0 - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_linear_path_is_monotone() {
        let path = linear_path((300.0, 10.0), (20.0, 400.0), 12);
        for w in path.windows(2) {
            assert!(w[1].0 < w[0].0);
            assert!(w[1].1 > w[0].1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_to_emits_at_least_six_points() {
        let page = SimulatedPage::builder().build();
        let target = BoundingBox {
            x: 400.0,
            y: 300.0,
            width: 100.0,
            height: 20.0,
        };
        for _ in 0..50 {
            let mut motion = MotionSimulator::at((0.0, 0.0));
            let n = motion.move_to(&page, &pacer(), &target, (0.0, 0.0)).await.unwrap();
            assert!(n >= MIN_STEPS + 1);
            assert!(n <= MIN_STEPS + EXTRA_STEPS as usize);
            assert_eq!(motion.cursor(), target.center());
        }
        assert!(page
            .pointer_events()
            .iter()
            .all(|e| e.kind == PointerKind::Moved));
    }

    #[tokio::test(start_paused = true)]
    async fn test_click_lands_within_jitter() {
        let page = SimulatedPage::builder()
            .element("booking", SimulatedElement::new("#go"))
            .build();
        let el = page.query("#go").await.unwrap().unwrap();
        let bounds = page.bounding_box(el).await.unwrap().unwrap();

        let mut motion = MotionSimulator::new();
        motion.click(&page, &pacer(), &bounds).await.unwrap();

        let events = page.pointer_events();
        let presses: Vec<_> = events
            .iter()
            .filter(|e| e.kind != PointerKind::Moved)
            .collect();
        assert_eq!(presses.len(), 2);
        assert_eq!(presses[0].kind, PointerKind::Pressed);
        assert_eq!(presses[1].kind, PointerKind::Released);
        let (cx, cy) = bounds.center();
        assert!((presses[0].x - cx).abs() <= 5.0 && (presses[0].y - cy).abs() <= 5.0);
        assert_eq!(page.clicks(), vec!["#go".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_click_takes_human_time() {
        let page = SimulatedPage::builder().build();
        let bounds = BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 50.0,
            height: 50.0,
        };
        let start = tokio::time::Instant::now();
        MotionSimulator::at((500.0, 500.0))
            .click(&page, &pacer(), &bounds)
            .await
            .unwrap();
        // 5 gaps of >= 20ms, pre-click 150, hold 50, post 200
        assert!(start.elapsed() >= std::time::Duration::from_millis(500));
    }
}
