//! Fixed-step numerical integration of continuous variables alongside the discrete event list.
//!
//! One recurring step event advances every active [`Continuous`] variable together. The
//! integrators are explicit Runge-Kutta schemes evaluated stage by stage: every variable's
//! tentative value for a stage is in place before any derivative of that stage runs, so a
//! derivative reading another variable through its handle sees the same stage.
use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
};

use tracing::{debug, trace};

use crate::{
    event::Event,
    simulator::{SimCore, Simulator},
    SimError,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Integrator {
    Euler { step: f64 },
    /// Midpoint rule.
    RungeKutta2 { step: f64 },
    /// Classical fourth order scheme.
    RungeKutta4 { step: f64 },
}

struct Tableau {
    /// Weight of the previous stage's slope in each stage's tentative value.
    a: &'static [f64],
    b: &'static [f64],
    c: &'static [f64],
}

const EULER: Tableau = Tableau {
    a: &[0.0],
    b: &[1.0],
    c: &[0.0],
};

const RUNGE_KUTTA2: Tableau = Tableau {
    a: &[0.0, 0.5],
    b: &[0.0, 1.0],
    c: &[0.0, 0.5],
};

const RUNGE_KUTTA4: Tableau = Tableau {
    a: &[0.0, 0.5, 0.5, 1.0],
    b: &[1.0 / 6.0, 1.0 / 3.0, 1.0 / 3.0, 1.0 / 6.0],
    c: &[0.0, 0.5, 0.5, 1.0],
};

impl Integrator {
    pub fn step(&self) -> f64 {
        match *self {
            Integrator::Euler { step }
            | Integrator::RungeKutta2 { step }
            | Integrator::RungeKutta4 { step } => step,
        }
    }

    pub fn validate(&self) -> Result<(), SimError> {
        let step = self.step();
        if step.is_finite() && step > 0.0 {
            Ok(())
        } else {
            Err(SimError::InvalidStep(step))
        }
    }

    fn tableau(&self) -> &'static Tableau {
        match self {
            Integrator::Euler { .. } => &EULER,
            Integrator::RungeKutta2 { .. } => &RUNGE_KUTTA2,
            Integrator::RungeKutta4 { .. } => &RUNGE_KUTTA4,
        }
    }
}

/// Integration state owned by the simulator.
#[derive(Default)]
pub(crate) struct ContinuousState {
    integrator: Option<Integrator>,
    active: Vec<Continuous>,
    step_event: Option<Event>,
}

impl ContinuousState {
    /// Deactivate every variable and disarm the step event.
    pub(crate) fn reset(&mut self) {
        for variable in self.active.drain(..) {
            variable.0.active.set(false);
        }
        if let Some(event) = &self.step_event {
            event.cancel();
        }
    }
}

type Derivative = Box<dyn Fn(f64, f64) -> f64>;
type StepHook = Box<dyn FnMut(&Simulator, f64) -> Result<(), SimError>>;

/// A real-valued state variable advanced by the simulator's integrator.
#[derive(Clone)]
pub struct Continuous(Rc<ContinuousInner>);

struct ContinuousInner {
    core: Weak<SimCore>,
    value: Cell<f64>,
    /// Value at the start of the step being computed.
    origin: Cell<f64>,
    /// Slope of the most recent stage.
    slope: Cell<f64>,
    /// Weighted sum of stage slopes.
    sum: Cell<f64>,
    active: Cell<bool>,
    derivative: RefCell<Derivative>,
    notify: RefCell<Option<Event>>,
    hook: RefCell<Option<StepHook>>,
}

impl Continuous {
    /// `derivative(t, value)` gives the rate of change of this variable.
    pub fn new<F>(sim: &Simulator, initial: f64, derivative: F) -> Self
    where
        F: Fn(f64, f64) -> f64 + 'static,
    {
        Self(Rc::new(ContinuousInner {
            core: sim.downgrade(),
            value: Cell::new(initial),
            origin: Cell::new(initial),
            slope: Cell::new(0.0),
            sum: Cell::new(0.0),
            active: Cell::new(false),
            derivative: RefCell::new(Box::new(derivative)),
            notify: RefCell::new(None),
            hook: RefCell::new(None),
        }))
    }

    pub fn set_derivative<F>(&self, derivative: F)
    where
        F: Fn(f64, f64) -> f64 + 'static,
    {
        *self.0.derivative.borrow_mut() = Box::new(derivative);
    }

    /// Current value. Inside a derivative this is the tentative value of the running stage.
    pub fn value(&self) -> f64 {
        self.0.value.get()
    }

    pub fn set_value(&self, value: f64) {
        self.0.value.set(value);
    }

    pub fn is_active(&self) -> bool {
        self.0.active.get()
    }

    /// Event rescheduled with `schedule_next` after every step that advances this variable.
    pub fn set_notify(&self, event: Option<Event>) {
        *self.0.notify.borrow_mut() = event;
    }

    /// Run `hook` with the new value after every step.
    pub fn on_step<F>(&self, hook: F)
    where
        F: FnMut(&Simulator, f64) -> Result<(), SimError> + 'static,
    {
        *self.0.hook.borrow_mut() = Some(Box::new(hook));
    }

    /// Add this variable to the active set, arming the step event if it was idle.
    pub fn start_integ(&self) -> Result<(), SimError> {
        let sim = Simulator::upgrade(&self.0.core)?;
        let mut state = sim.core.continuous.borrow_mut();
        let integrator = state.integrator.ok_or(SimError::NoIntegrator)?;
        if self.is_active() {
            return Ok(());
        }
        self.0.active.set(true);
        state.active.push(self.clone());
        let event = state
            .step_event
            .get_or_insert_with(|| Event::new(&sim, integrate))
            .clone();
        drop(state);
        if !event.is_pending() {
            event.schedule(integrator.step())?;
            debug!(time = sim.time(), step = integrator.step(), "integration started");
        }
        Ok(())
    }

    pub fn start_integ_from(&self, value: f64) -> Result<(), SimError> {
        self.set_value(value);
        self.start_integ()
    }

    /// Remove this variable from the active set; the last one out disarms the step event.
    pub fn stop_integ(&self) -> Result<(), SimError> {
        let sim = Simulator::upgrade(&self.0.core)?;
        let mut state = sim.core.continuous.borrow_mut();
        if !self.0.active.replace(false) {
            return Ok(());
        }
        state.active.retain(|variable| !Rc::ptr_eq(&variable.0, &self.0));
        if state.active.is_empty() {
            if let Some(event) = &state.step_event {
                event.cancel();
            }
            debug!(time = sim.time(), "integration stopped");
        }
        Ok(())
    }

    fn derivative(&self, t: f64) -> f64 {
        (self.0.derivative.borrow())(t, self.value())
    }

    fn after_step(&self, sim: &Simulator) -> Result<(), SimError> {
        let notify = self.0.notify.borrow().clone();
        if let Some(event) = notify {
            event.cancel();
            event.schedule_next()?;
        }
        let hook = self.0.hook.borrow_mut().take();
        if let Some(mut hook) = hook {
            let outcome = hook(sim, self.value());
            let mut slot = self.0.hook.borrow_mut();
            if slot.is_none() {
                *slot = Some(hook);
            }
            outcome?;
        }
        Ok(())
    }
}

impl fmt::Debug for Continuous {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuous")
            .field("value", &self.value())
            .field("active", &self.is_active())
            .finish()
    }
}

/// Action of the step event: advance every active variable by one step ending at the
/// current time.
fn integrate(sim: &Simulator) -> Result<(), SimError> {
    let (integrator, variables) = {
        let state = sim.core.continuous.borrow();
        match state.integrator {
            Some(integrator) => (integrator, state.active.clone()),
            None => return Ok(()),
        }
    };
    let h = integrator.step();
    let t0 = sim.time() - h;
    let tableau = integrator.tableau();

    for variable in &variables {
        variable.0.origin.set(variable.value());
        variable.0.sum.set(0.0);
    }
    for stage in 0..tableau.b.len() {
        if stage > 0 {
            for variable in &variables {
                let inner = &variable.0;
                inner
                    .value
                    .set(inner.origin.get() + h * tableau.a[stage] * inner.slope.get());
            }
        }
        let t = t0 + tableau.c[stage] * h;
        let slopes: Vec<f64> = variables.iter().map(|v| v.derivative(t)).collect();
        for (variable, slope) in variables.iter().zip(slopes) {
            variable.0.slope.set(slope);
            let inner = &variable.0;
            inner.sum.set(inner.sum.get() + tableau.b[stage] * slope);
        }
    }
    for variable in &variables {
        let inner = &variable.0;
        inner.value.set(inner.origin.get() + h * inner.sum.get());
    }
    trace!(time = sim.time(), variables = variables.len(), "integration step");

    for variable in &variables {
        variable.after_step(sim)?;
    }

    let rearm = {
        let state = sim.core.continuous.borrow();
        match state.step_event.clone() {
            Some(event) if !state.active.is_empty() => Some(event),
            _ => None,
        }
    };
    if let Some(event) = rearm {
        if !event.is_pending() {
            event.schedule(h)?;
        }
    }
    Ok(())
}

impl Simulator {
    pub fn select_euler(&self, step: f64) -> Result<(), SimError> {
        self.select_integrator(Integrator::Euler { step })
    }

    pub fn select_runge_kutta2(&self, step: f64) -> Result<(), SimError> {
        self.select_integrator(Integrator::RungeKutta2 { step })
    }

    pub fn select_runge_kutta4(&self, step: f64) -> Result<(), SimError> {
        self.select_integrator(Integrator::RungeKutta4 { step })
    }

    /// Select the integration method. Fails while any variable is being integrated.
    pub fn select_integrator(&self, integrator: Integrator) -> Result<(), SimError> {
        integrator.validate()?;
        let mut state = self.core.continuous.borrow_mut();
        if !state.active.is_empty() {
            return Err(SimError::IntegratorBusy);
        }
        state.integrator = Some(integrator);
        debug!(?integrator, "integrator selected");
        Ok(())
    }

    pub fn integrator(&self) -> Option<Integrator> {
        self.core.continuous.borrow().integrator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grow(sim: &Simulator, integrator: Integrator) -> f64 {
        sim.select_integrator(integrator).unwrap();
        let y = Continuous::new(sim, 1.0, |_, y| y);
        y.start_integ().unwrap();
        sim.run_until(1.05).unwrap();
        y.value()
    }

    #[test]
    fn test_euler_linear_growth() {
        let sim = Simulator::new();
        sim.select_euler(1.0).unwrap();
        let x = Continuous::new(&sim, 0.0, |_, _| 1.0);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let record = Rc::clone(&seen);
        x.on_step(move |_, value| {
            record.borrow_mut().push(value);
            Ok(())
        });
        x.start_integ().unwrap();
        sim.run_until(3.5).unwrap();
        assert_eq!(*seen.borrow(), vec![1.0, 2.0, 3.0]);
        assert_eq!(x.value(), 3.0);
    }

    #[test]
    fn test_exponential_growth_accuracy() {
        let euler = grow(&Simulator::new(), Integrator::Euler { step: 0.1 });
        assert!((euler - 2.593_742_460_1).abs() < 1e-9);

        let rk2 = grow(&Simulator::new(), Integrator::RungeKutta2 { step: 0.1 });
        assert!((rk2 - 2.714_080_846_6).abs() < 1e-9);

        let rk4 = grow(&Simulator::new(), Integrator::RungeKutta4 { step: 0.1 });
        assert!((rk4 - std::f64::consts::E).abs() < 1e-5);
    }

    #[test]
    fn test_euler_evaluates_against_snapshot() {
        let sim = Simulator::new();
        sim.select_euler(0.1).unwrap();
        let x = Continuous::new(&sim, 1.0, |_, _| 0.0);
        let y = Continuous::new(&sim, 0.0, |_, _| 0.0);
        let (xh, yh) = (x.clone(), y.clone());
        x.set_derivative(move |_, _| yh.value() + 1.0);
        y.set_derivative(move |_, _| xh.value());
        x.start_integ().unwrap();
        y.start_integ().unwrap();
        sim.run_until(0.15).unwrap();
        assert!((x.value() - 1.1).abs() < 1e-12);
        // reading the already advanced x would give 0.11
        assert!((y.value() - 0.1).abs() < 1e-12);
        x.set_derivative(|_, _| 0.0);
        y.set_derivative(|_, _| 0.0);
    }

    #[test]
    fn test_runge_kutta4_stages_are_synchronous() {
        let sim = Simulator::new();
        sim.select_runge_kutta4(0.1).unwrap();
        let x = Continuous::new(&sim, 1.0, |_, _| 0.0);
        let y = Continuous::new(&sim, 0.0, |_, _| 0.0);
        let (xh, yh) = (x.clone(), y.clone());
        x.set_derivative(move |_, _| -yh.value());
        y.set_derivative(move |_, _| xh.value());
        x.start_integ().unwrap();
        y.start_integ().unwrap();
        sim.run_until(0.15).unwrap();
        assert!((x.value() - 0.1f64.cos()).abs() < 1e-6);
        assert!((y.value() - 0.1f64.sin()).abs() < 1e-6);
        x.set_derivative(|_, _| 0.0);
        y.set_derivative(|_, _| 0.0);
    }

    #[test]
    fn test_derivative_sees_stage_time() {
        let sim = Simulator::new();
        sim.select_runge_kutta2(0.5).unwrap();
        // y' = t integrates exactly under the midpoint rule
        let y = Continuous::new(&sim, 0.0, |t, _| t);
        y.start_integ().unwrap();
        sim.run_until(2.25).unwrap();
        assert!((y.value() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_start_without_integrator_fails() {
        let sim = Simulator::new();
        let x = Continuous::new(&sim, 0.0, |_, _| 1.0);
        assert_eq!(x.start_integ(), Err(SimError::NoIntegrator));
        assert!(!x.is_active());
    }

    #[test]
    fn test_select_while_active_fails() {
        let sim = Simulator::new();
        sim.select_euler(1.0).unwrap();
        assert_eq!(sim.select_euler(-1.0), Err(SimError::InvalidStep(-1.0)));
        let x = Continuous::new(&sim, 0.0, |_, _| 1.0);
        x.start_integ().unwrap();
        assert_eq!(sim.select_runge_kutta4(0.5), Err(SimError::IntegratorBusy));
        x.stop_integ().unwrap();
        sim.select_runge_kutta4(0.5).unwrap();
        assert_eq!(sim.integrator(), Some(Integrator::RungeKutta4 { step: 0.5 }));
    }

    #[test]
    fn test_stop_of_last_variable_disarms_step() {
        let sim = Simulator::new();
        sim.select_euler(1.0).unwrap();
        let a = Continuous::new(&sim, 0.0, |_, _| 1.0);
        let b = Continuous::new(&sim, 0.0, |_, _| 2.0);
        a.start_integ().unwrap();
        b.start_integ().unwrap();
        assert_eq!(sim.pending_events(), 1);
        a.stop_integ().unwrap();
        assert_eq!(sim.pending_events(), 1);
        b.stop_integ().unwrap();
        assert_eq!(sim.pending_events(), 0);
        sim.start().unwrap();
        assert_eq!(b.value(), 0.0);
    }

    #[test]
    fn test_hook_can_stop_integration() {
        let sim = Simulator::new();
        sim.select_euler(0.5).unwrap();
        let level = Continuous::new(&sim, 0.0, |_, _| 2.0);
        let me = level.clone();
        level.on_step(move |_, value| {
            if value >= 3.0 {
                me.stop_integ()?;
            }
            Ok(())
        });
        level.start_integ().unwrap();
        // the list empties once the level reaches 3
        sim.start().unwrap();
        assert_eq!(level.value(), 3.0);
        assert_eq!(sim.time(), 1.5);
        assert!(!level.is_active());
        level.on_step(|_, _| Ok(()));
    }

    #[test]
    fn test_notify_event_fires_each_step() {
        let sim = Simulator::new();
        sim.select_euler(1.0).unwrap();
        let x = Continuous::new(&sim, 0.0, |_, _| 1.0);
        let fired = Rc::new(RefCell::new(Vec::new()));
        let record = Rc::clone(&fired);
        let probe = x.clone();
        let notify = Event::new(&sim, move |sim: &Simulator| {
            record.borrow_mut().push((sim.time(), probe.value()));
            Ok(())
        });
        x.set_notify(Some(notify));
        x.start_integ().unwrap();
        sim.run_until(2.5).unwrap();
        assert_eq!(*fired.borrow(), vec![(1.0, 1.0), (2.0, 2.0)]);
        x.set_notify(None);
    }

    #[test]
    fn test_init_deactivates_variables() {
        let sim = Simulator::new();
        sim.select_euler(1.0).unwrap();
        let x = Continuous::new(&sim, 0.0, |_, _| 1.0);
        x.start_integ().unwrap();
        sim.run_until(2.5).unwrap();
        sim.init();
        assert!(!x.is_active());
        assert_eq!(sim.pending_events(), 0);
        x.start_integ_from(10.0).unwrap();
        sim.run_until(1.5).unwrap();
        assert_eq!(x.value(), 11.0);
    }
}
