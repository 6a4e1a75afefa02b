//! Ordered fallback strategies for a single navigation step.

use std::{
    thread::sleep,
    time::{Duration, Instant},
};

type Attempt<'a, C> = Box<dyn Fn(&C) -> anyhow::Result<()> + 'a>;

/// Strategies tried in order until one runs without error and the shared
/// success predicate confirms the page actually changed.
pub struct Ladder<'a, C> {
    target: &'static str,
    attempts: Vec<(&'static str, Attempt<'a, C>)>,
}

impl<'a, C> Ladder<'a, C> {
    pub fn new(target: &'static str) -> Self {
        Self {
            target,
            attempts: Vec::new(),
        }
    }

    #[must_use]
    pub fn then(
        mut self,
        name: &'static str,
        attempt: impl Fn(&C) -> anyhow::Result<()> + 'a,
    ) -> Self {
        self.attempts.push((name, Box::new(attempt)));
        self
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// Name of the strategy that worked, or `None` once all were exhausted.
    ///
    /// After an attempt runs without error, `moved` is polled for up to
    /// `patience`. It is checked once more before the next rung runs; an
    /// effect that lands late is credited to the attempt that caused it.
    pub fn run(&self, ctx: &C, patience: Duration, moved: impl Fn(&C) -> bool) -> Option<&'static str> {
        let mut pending = None;
        for (name, attempt) in &self.attempts {
            if let Some(late) = pending
                && moved(ctx)
            {
                tracing::info!(target: "ladder", "[{}] {late} took effect late", self.target);
                return Some(late);
            }

            match attempt(ctx) {
                Ok(()) if settle(ctx, patience, &moved) => {
                    tracing::debug!(target: "ladder", "[{}] {name} succeeded", self.target);
                    return Some(*name);
                }
                Ok(()) => {
                    tracing::debug!(target: "ladder", "[{}] {name} ran but nothing changed", self.target);
                    pending = Some(*name);
                }
                Err(err) => {
                    tracing::debug!(target: "ladder", "[{}] {name} failed: {err}", self.target);
                }
            }
        }

        if let Some(late) = pending
            && moved(ctx)
        {
            tracing::info!(target: "ladder", "[{}] {late} took effect late", self.target);
            return Some(late);
        }
        tracing::warn!(target: "ladder", "[{}] all {} strategies exhausted", self.target, self.attempts.len());
        None
    }
}

fn settle<C>(ctx: &C, patience: Duration, moved: impl Fn(&C) -> bool) -> bool {
    const PERIOD: Duration = Duration::from_millis(500);

    let deadline = Instant::now() + patience;
    loop {
        if moved(ctx) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(PERIOD.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use core::cell::{Cell, RefCell};

    use super::*;

    #[derive(Default)]
    struct Fake {
        page: Cell<u32>,
        log: RefCell<Vec<&'static str>>,
    }

    #[test]
    fn stops_at_first_effective_strategy() {
        let fake = Fake::default();
        let ladder = Ladder::new("test")
            .then("js", |c: &Fake| {
                c.log.borrow_mut().push("js");
                anyhow::bail!("element detached")
            })
            .then("native", |c: &Fake| {
                c.log.borrow_mut().push("native");
                Ok(())
            })
            .then("url", |c: &Fake| {
                c.log.borrow_mut().push("url");
                c.page.set(2);
                Ok(())
            })
            .then("never", |c: &Fake| {
                c.log.borrow_mut().push("never");
                Ok(())
            });

        assert_eq!(ladder.run(&fake, Duration::ZERO, |c| c.page.get() == 2), Some("url"));
        assert_eq!(*fake.log.borrow(), ["js", "native", "url"]);
    }

    #[test]
    fn exhausted_ladder_reports_none() {
        let fake = Fake::default();
        let ladder = Ladder::new("test").then("noop", |_: &Fake| Ok(()));
        assert_eq!(ladder.len(), 1);
        assert_eq!(ladder.run(&fake, Duration::ZERO, |_| false), None);
    }

    #[test]
    fn late_effect_is_not_clicked_twice() {
        let fake = Fake::default();
        let checks = Cell::new(0);
        let ladder = Ladder::new("test")
            .then("page link", |c: &Fake| {
                c.log.borrow_mut().push("page link");
                Ok(())
            })
            .then("next", |c: &Fake| {
                c.log.borrow_mut().push("next");
                Ok(())
            });

        // The first check (right after the click) sees the old page, the next one the new page.
        let moved = |_: &Fake| {
            checks.set(checks.get() + 1);
            checks.get() > 1
        };
        assert_eq!(ladder.run(&fake, Duration::ZERO, moved), Some("page link"));
        assert_eq!(*fake.log.borrow(), ["page link"]);
    }
}
