//! Simulated DOM backend
//!
//! An in-memory booking site for running the executor without a browser.
//! Elements declare which selectors they answer to, belong to a named view
//! (one "page") and optionally to a group that only renders once activated by
//! a click. Pointer presses are hit-tested against element boxes, so a click
//! only lands when the synthetic cursor actually reaches the element.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use super::{BoundingBox, ElementHandle, PageDriver, PointerEvent, PointerKind, ReadyState};
use crate::error::{Error, Result};

/// What happens when an element is clicked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickAction {
    /// Nothing beyond recording the click
    None,
    /// Switch to another view (full navigation)
    Navigate(String),
    /// Render the elements of a group, hiding any previously active group
    Activate(String),
}

/// An element of the simulated page
#[derive(Debug, Clone)]
pub struct SimulatedElement {
    selectors: Vec<String>,
    text: String,
    attributes: HashMap<String, String>,
    group: Option<String>,
    action: ClickAction,
    label: Option<String>,
}

impl SimulatedElement {
    /// Element answering to the given selector
    pub fn new(selector: impl Into<String>) -> Self {
        Self {
            selectors: vec![selector.into()],
            text: String::new(),
            attributes: HashMap::new(),
            group: None,
            action: ClickAction::None,
            label: None,
        }
    }

    /// Also answer to another selector
    pub fn also(mut self, selector: impl Into<String>) -> Self {
        self.selectors.push(selector.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Only render while `group` is active
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn on_click(mut self, action: ClickAction) -> Self {
        self.action = action;
        self
    }

    /// Name used in the click log (defaults to the first selector)
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    fn display_label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| self.selectors.first().cloned().unwrap_or_default())
    }

    fn matches(&self, selector: &str) -> bool {
        selector
            .split(',')
            .map(str::trim)
            .any(|part| self.selectors.iter().any(|s| s == part))
    }
}

type Hook = Arc<dyn Fn() + Send + Sync>;

struct Node {
    view: String,
    element: SimulatedElement,
    bounds: BoundingBox,
}

struct PageState {
    view: String,
    active_group: Option<String>,
    loading_polls_left: u32,
    pressed: Option<(f64, f64)>,
    scroll_y: f64,
    events: Vec<PointerEvent>,
    clicks: Vec<String>,
    init_scripts: Vec<String>,
    evaluations: Vec<String>,
    navigations: Vec<String>,
}

/// In-memory page implementing [`PageDriver`]
pub struct SimulatedPage {
    context: String,
    nodes: Vec<Node>,
    body_text: HashMap<String, String>,
    load_polls: u32,
    fail_masking: bool,
    hooks: Vec<(String, Hook)>,
    init_script_hook: Option<Hook>,
    state: Mutex<PageState>,
    calls: AtomicUsize,
}

/// Builder for [`SimulatedPage`]
pub struct SimulatedPageBuilder {
    start_view: String,
    nodes: Vec<(String, SimulatedElement)>,
    body_text: HashMap<String, String>,
    load_polls: u32,
    fail_masking: bool,
    never_loads: bool,
    hooks: Vec<(String, Hook)>,
    init_script_hook: Option<Hook>,
}

impl SimulatedPageBuilder {
    /// View shown first
    pub fn start_at(mut self, view: impl Into<String>) -> Self {
        self.start_view = view.into();
        self
    }

    /// Add an element to a view
    pub fn element(mut self, view: impl Into<String>, element: SimulatedElement) -> Self {
        self.nodes.push((view.into(), element));
        self
    }

    /// Free text rendered in a view outside any element
    pub fn body_text(mut self, view: impl Into<String>, text: impl Into<String>) -> Self {
        self.body_text.insert(view.into(), text.into());
        self
    }

    /// Number of `readyState` polls that report loading after a navigation
    pub fn load_polls(mut self, polls: u32) -> Self {
        self.load_polls = polls;
        self
    }

    /// Navigations never complete
    pub fn never_loads(mut self) -> Self {
        self.never_loads = true;
        self
    }

    /// Init script registration fails
    pub fn fail_masking(mut self) -> Self {
        self.fail_masking = true;
        self
    }

    /// Run `hook` whenever the element with this label is clicked
    pub fn on_click_hook(
        mut self,
        label: impl Into<String>,
        hook: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        self.hooks.push((label.into(), Arc::new(hook)));
        self
    }

    /// Run `hook` after an init script is registered
    pub fn on_init_script_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.init_script_hook = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> SimulatedPage {
        // One column per view, one row per element in insertion order
        let mut rows: HashMap<String, usize> = HashMap::new();
        let nodes = self
            .nodes
            .into_iter()
            .map(|(view, element)| {
                let row = rows.entry(view.clone()).or_insert(0);
                let bounds = BoundingBox {
                    x: 120.0,
                    y: 80.0 + *row as f64 * 48.0,
                    width: 240.0,
                    height: 32.0,
                };
                *row += 1;
                Node {
                    view,
                    element,
                    bounds,
                }
            })
            .collect();

        let load_polls = if self.never_loads {
            u32::MAX
        } else {
            self.load_polls
        };

        SimulatedPage {
            context: "ctx-1".to_string(),
            nodes,
            body_text: self.body_text,
            load_polls,
            fail_masking: self.fail_masking,
            hooks: self.hooks,
            init_script_hook: self.init_script_hook,
            state: Mutex::new(PageState {
                view: self.start_view,
                active_group: None,
                loading_polls_left: 0,
                pressed: None,
                scroll_y: 0.0,
                events: Vec::new(),
                clicks: Vec::new(),
                init_scripts: Vec::new(),
                evaluations: Vec::new(),
                navigations: Vec::new(),
            }),
            calls: AtomicUsize::new(0),
        }
    }
}

impl SimulatedPage {
    pub fn builder() -> SimulatedPageBuilder {
        SimulatedPageBuilder {
            start_view: "booking".to_string(),
            nodes: Vec::new(),
            body_text: HashMap::new(),
            load_polls: 2,
            fail_masking: false,
            never_loads: false,
            hooks: Vec::new(),
            init_script_hook: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PageState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn touch(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn is_rendered(node: &Node, state: &PageState) -> bool {
        node.view == state.view
            && match &node.element.group {
                None => true,
                Some(g) => state.active_group.as_deref() == Some(g.as_str()),
            }
    }

    fn node(&self, element: ElementHandle) -> Result<&Node> {
        self.nodes
            .get(element.0 as usize)
            .ok_or_else(|| Error::driver("resolve", format!("stale element {}", element.0)))
    }

    fn hit_test(&self, state: &PageState, point: (f64, f64)) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| Self::is_rendered(n, state) && n.bounds.contains(point))
    }

    /// Number of driver calls made so far
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Labels of the elements clicked, in order
    pub fn clicks(&self) -> Vec<String> {
        self.lock().clicks.clone()
    }

    /// Every pointer event dispatched
    pub fn pointer_events(&self) -> Vec<PointerEvent> {
        self.lock().events.clone()
    }

    /// Init scripts registered
    pub fn init_scripts(&self) -> Vec<String> {
        self.lock().init_scripts.clone()
    }

    /// Expressions evaluated in the page, in order
    pub fn evaluations(&self) -> Vec<String> {
        self.lock().evaluations.clone()
    }

    /// Views visited through navigation
    pub fn navigations(&self) -> Vec<String> {
        self.lock().navigations.clone()
    }

    /// Currently displayed view
    pub fn current_view(&self) -> String {
        self.lock().view.clone()
    }

    /// Accumulated vertical scroll
    pub fn scroll_offset(&self) -> f64 {
        self.lock().scroll_y
    }

    fn release(&self, x: f64, y: f64) {
        let mut hook = None;
        {
            let mut state = self.lock();
            let Some(pressed) = state.pressed.take() else {
                return;
            };
            let (Some(down), Some(up)) = (self.hit_test(&state, pressed), self.hit_test(&state, (x, y)))
            else {
                return;
            };
            if down != up {
                return;
            }

            let element = &self.nodes[up].element;
            let label = element.display_label();
            state.clicks.push(label.clone());
            match &element.action {
                ClickAction::None => {}
                ClickAction::Activate(group) => state.active_group = Some(group.clone()),
                ClickAction::Navigate(view) => {
                    state.view = view.clone();
                    state.active_group = None;
                    state.loading_polls_left = self.load_polls;
                    state.navigations.push(view.clone());
                }
            }

            if let Some((_, h)) = self.hooks.iter().find(|(l, _)| *l == label) {
                hook = Some(Arc::clone(h));
            }
        }
        if let Some(h) = hook {
            h();
        }
    }
}

#[async_trait]
impl PageDriver for SimulatedPage {
    async fn context_id(&self) -> Result<String> {
        self.touch();
        Ok(self.context.clone())
    }

    async fn query(&self, selector: &str) -> Result<Option<ElementHandle>> {
        Ok(self.query_all(selector).await?.into_iter().next())
    }

    async fn query_all(&self, selector: &str) -> Result<Vec<ElementHandle>> {
        self.touch();
        let state = self.lock();
        Ok(self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| Self::is_rendered(n, &state) && n.element.matches(selector))
            .map(|(i, _)| ElementHandle(i as u64))
            .collect())
    }

    async fn bounding_box(&self, element: ElementHandle) -> Result<Option<BoundingBox>> {
        self.touch();
        let node = self.node(element)?;
        let state = self.lock();
        Ok(Self::is_rendered(node, &state).then_some(node.bounds))
    }

    async fn read_text(&self, element: ElementHandle) -> Result<String> {
        self.touch();
        Ok(self.node(element)?.element.text.clone())
    }

    async fn attribute(&self, element: ElementHandle, name: &str) -> Result<Option<String>> {
        self.touch();
        Ok(self.node(element)?.element.attributes.get(name).cloned())
    }

    async fn page_text(&self) -> Result<String> {
        self.touch();
        let state = self.lock();
        let mut parts: Vec<&str> = self
            .nodes
            .iter()
            .filter(|n| Self::is_rendered(n, &state))
            .map(|n| n.element.text.as_str())
            .filter(|t| !t.is_empty())
            .collect();
        if let Some(body) = self.body_text.get(&state.view) {
            parts.push(body);
        }
        Ok(parts.join("\n"))
    }

    async fn dispatch_pointer(&self, event: PointerEvent) -> Result<()> {
        self.touch();
        self.lock().events.push(event);
        match event.kind {
            PointerKind::Moved => {}
            PointerKind::Pressed => self.lock().pressed = Some((event.x, event.y)),
            PointerKind::Released => self.release(event.x, event.y),
        }
        Ok(())
    }

    async fn scroll_by(&self, delta_y: f64) -> Result<()> {
        self.touch();
        self.lock().scroll_y += delta_y;
        Ok(())
    }

    async fn ready_state(&self) -> Result<ReadyState> {
        self.touch();
        let mut state = self.lock();
        if state.loading_polls_left == 0 {
            return Ok(ReadyState::Complete);
        }
        if state.loading_polls_left != u32::MAX {
            state.loading_polls_left -= 1;
        }
        Ok(ReadyState::Loading)
    }

    async fn add_init_script(&self, script: &str) -> Result<()> {
        self.touch();
        if self.fail_masking {
            return Err(Error::driver(
                "add_init_script",
                "target closed before script registration",
            ));
        }
        self.lock().init_scripts.push(script.to_string());
        if let Some(hook) = &self.init_script_hook {
            hook();
        }
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        self.touch();
        let mut state = self.lock();
        state.evaluations.push(expression.to_string());
        if expression.contains("navigator.webdriver") {
            let masked = state.init_scripts.iter().any(|s| s.contains("webdriver"));
            return Ok(Value::Bool(masked));
        }
        if expression.trim() == "document.readyState" {
            let ready = if state.loading_polls_left == 0 {
                "complete"
            } else {
                "loading"
            };
            return Ok(Value::String(ready.to_string()));
        }
        Ok(Value::Null)
    }
}

/// A booking site laid out for the default [`PageSelectors`](crate::PageSelectors).
///
/// Views: `booking` (current booking + change link), `calendar` (one marker
/// per offered date, time options revealed by clicking it, continue button),
/// `review` (confirm button) and `confirmed` (success indicator). Every view
/// but `booking` carries a "Manage booking" link back to it.
#[derive(Debug, Clone, Default)]
pub struct BookingSite {
    booking_date: String,
    booking_time: String,
    centre: Option<String>,
    text_only: bool,
    no_change_link: bool,
    no_continue: bool,
    no_confirm: bool,
    silent_confirmation: bool,
    offered: Vec<(String, Option<String>, Vec<String>)>,
}

impl BookingSite {
    /// Site whose current booking is shown as the given date and time text
    pub fn new(booking_date: impl Into<String>, booking_time: impl Into<String>) -> Self {
        Self {
            booking_date: booking_date.into(),
            booking_time: booking_time.into(),
            ..Default::default()
        }
    }

    pub fn centre(mut self, centre: impl Into<String>) -> Self {
        self.centre = Some(centre.into());
        self
    }

    /// Render the booking only as free text (no booking selectors)
    pub fn text_only(mut self) -> Self {
        self.text_only = true;
        self
    }

    /// Offer an ISO date with the given time strings
    pub fn offer(mut self, date: impl Into<String>, times: &[&str]) -> Self {
        self.offered.push((
            date.into(),
            None,
            times.iter().map(|t| t.to_string()).collect(),
        ));
        self
    }

    /// Offer a date advertised for a specific centre
    pub fn offer_at(
        mut self,
        date: impl Into<String>,
        centre: impl Into<String>,
        times: &[&str],
    ) -> Self {
        self.offered.push((
            date.into(),
            Some(centre.into()),
            times.iter().map(|t| t.to_string()).collect(),
        ));
        self
    }

    pub fn without_change_link(mut self) -> Self {
        self.no_change_link = true;
        self
    }

    pub fn without_continue(mut self) -> Self {
        self.no_continue = true;
        self
    }

    pub fn without_confirm(mut self) -> Self {
        self.no_confirm = true;
        self
    }

    /// Confirming lands on a page without the success indicator
    pub fn silent_confirmation(mut self) -> Self {
        self.silent_confirmation = true;
        self
    }

    /// Builder pre-populated with the site, for further customisation
    pub fn builder(self) -> SimulatedPageBuilder {
        let mut b = SimulatedPage::builder().start_at("booking");

        if self.text_only {
            let mut text = format!(
                "Your appointment\nDate: {} Time: {}",
                self.booking_date, self.booking_time
            );
            if let Some(c) = &self.centre {
                text.push_str(&format!("\nTest centre: {c}"));
            }
            b = b.body_text("booking", text);
        } else {
            b = b
                .element(
                    "booking",
                    SimulatedElement::new("#booking-date").text(&self.booking_date),
                )
                .element(
                    "booking",
                    SimulatedElement::new("#booking-time").text(&self.booking_time),
                );
            if let Some(c) = &self.centre {
                b = b.element("booking", SimulatedElement::new("#booking-centre").text(c));
            }
        }

        if !self.no_change_link {
            b = b.element(
                "booking",
                SimulatedElement::new("#change-booking")
                    .text("Change date")
                    .on_click(ClickAction::Navigate("calendar".into())),
            );
        }

        for (date, centre, _) in &self.offered {
            let mut marker = SimulatedElement::new("td.slot-available[data-date]")
                .attr("data-date", date)
                .text(date)
                .label(format!("date:{date}"))
                .on_click(ClickAction::Activate(date.clone()));
            if let Some(c) = centre {
                marker = marker.attr("data-centre", c);
            }
            b = b.element("calendar", marker);
        }
        for (date, _, times) in &self.offered {
            for t in times {
                b = b.element(
                    "calendar",
                    SimulatedElement::new("[data-slot-time]")
                        .attr("data-slot-time", t)
                        .text(t)
                        .in_group(date)
                        .label(format!("time:{date}:{t}")),
                );
            }
        }
        if !self.no_continue {
            b = b.element(
                "calendar",
                SimulatedElement::new("#slot-continue")
                    .text("Continue")
                    .on_click(ClickAction::Navigate("review".into())),
            );
        }

        if !self.no_confirm {
            let landing = if self.silent_confirmation {
                "limbo"
            } else {
                "confirmed"
            };
            b = b.element(
                "review",
                SimulatedElement::new("#confirm-booking")
                    .text("Confirm changes")
                    .on_click(ClickAction::Navigate(landing.into())),
            );
        }
        b = b
            .body_text("review", "Check your new appointment details")
            .element(
                "confirmed",
                SimulatedElement::new("#booking-confirmed").text("Your booking has been changed"),
            )
            .body_text("limbo", "Something went wrong");

        for view in ["calendar", "review", "confirmed", "limbo"] {
            b = b.element(
                view,
                SimulatedElement::new("#view-booking")
                    .text("Manage booking")
                    .on_click(ClickAction::Navigate("booking".into())),
            );
        }

        b
    }

    pub fn build(self) -> SimulatedPage {
        self.builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn click(page: &SimulatedPage, selector: &str) {
        let el = page.query(selector).await.unwrap().unwrap();
        let (x, y) = page.bounding_box(el).await.unwrap().unwrap().center();
        page.dispatch_pointer(PointerEvent::pressed(x, y)).await.unwrap();
        page.dispatch_pointer(PointerEvent::released(x, y)).await.unwrap();
    }

    #[tokio::test]
    async fn test_selector_list_matching() {
        let page = BookingSite::new("1 March 2025", "8:10am").build();
        let el = page
            .query("#missing, #booking-date")
            .await
            .unwrap()
            .expect("second selector matches");
        assert_eq!(page.read_text(el).await.unwrap(), "1 March 2025");
    }

    #[tokio::test]
    async fn test_click_navigates_and_loads() {
        let page = BookingSite::new("1 March 2025", "8:10am")
            .offer("2025-02-10", &["09:00"])
            .build();

        click(&page, "#change-booking").await;
        assert_eq!(page.current_view(), "calendar");
        assert_eq!(page.ready_state().await.unwrap(), ReadyState::Loading);
        assert_eq!(page.ready_state().await.unwrap(), ReadyState::Loading);
        assert_eq!(page.ready_state().await.unwrap(), ReadyState::Complete);
    }

    #[tokio::test]
    async fn test_manage_link_returns_to_booking() {
        let page = BookingSite::new("1 March 2025", "8:10am")
            .offer("2025-02-10", &["09:00"])
            .build();
        assert!(page.query("#view-booking").await.unwrap().is_none());

        click(&page, "#change-booking").await;
        click(&page, "#view-booking").await;
        assert_eq!(page.current_view(), "booking");
        assert_eq!(page.navigations(), vec!["calendar", "booking"]);
        assert!(page.query("#booking-date").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_group_renders_after_activation() {
        let page = BookingSite::new("1 March 2025", "8:10am")
            .offer("2025-02-10", &["09:00", "10:30"])
            .builder()
            .start_at("calendar")
            .build();

        assert!(page.query_all("[data-slot-time]").await.unwrap().is_empty());
        click(&page, "td.slot-available[data-date]").await;
        assert_eq!(page.query_all("[data-slot-time]").await.unwrap().len(), 2);
        assert_eq!(page.clicks(), vec!["date:2025-02-10".to_string()]);
    }

    #[tokio::test]
    async fn test_release_off_target_is_not_a_click() {
        let page = BookingSite::new("1 March 2025", "8:10am").build();
        let el = page.query("#change-booking").await.unwrap().unwrap();
        let (x, y) = page.bounding_box(el).await.unwrap().unwrap().center();
        page.dispatch_pointer(PointerEvent::pressed(x, y)).await.unwrap();
        page.dispatch_pointer(PointerEvent::released(5.0, 5.0))
            .await
            .unwrap();
        assert!(page.clicks().is_empty());
        assert_eq!(page.current_view(), "booking");
    }

    #[test]
    fn test_text_only_site_has_no_booking_selectors() {
        let page = BookingSite::new("1 March 2025", "8:10am")
            .centre("Leeds")
            .text_only()
            .build();
        tokio_test::block_on(async {
            assert!(page.query("#booking-date").await.unwrap().is_none());
            let text = page.page_text().await.unwrap();
            assert!(text.contains("1 March 2025"));
            assert!(text.contains("Test centre: Leeds"));
        });
    }
}
