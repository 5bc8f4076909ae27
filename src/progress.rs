//! Build progress tracking and reporting, for display to the user.

use crate::command::Command;

/// States a command moves through under the executor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CmdState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

const NSTATES: usize = 6;

fn state_index(s: CmdState) -> usize {
    match s {
        CmdState::Pending => 0,
        CmdState::Ready => 1,
        CmdState::Running => 2,
        CmdState::Succeeded => 3,
        CmdState::Failed => 4,
        CmdState::Skipped => 5,
    }
}

/// Counts of commands per state, for progress display.
#[derive(Debug, Default, Clone)]
pub struct StateCounts([usize; NSTATES]);

impl StateCounts {
    pub fn get(&self, s: CmdState) -> usize {
        self.0[state_index(s)]
    }

    pub fn add(&mut self, s: CmdState, n: usize) {
        self.0[state_index(s)] += n;
    }

    pub fn sub(&mut self, s: CmdState, n: usize) {
        self.0[state_index(s)] -= n;
    }

    pub fn total(&self) -> usize {
        self.0.iter().sum()
    }

    /// Commands in a terminal state.
    pub fn done(&self) -> usize {
        self.get(CmdState::Succeeded) + self.get(CmdState::Failed) + self.get(CmdState::Skipped)
    }
}

/// How a command's turn through the executor ended.
pub enum Outcome<'a> {
    /// Inputs up to date and outputs present; not run.
    Skipped,
    Succeeded { output: &'a [u8] },
    Failed { message: String },
}

/// Trait for build progress notifications.
pub trait Progress {
    /// Called as commands move between states.
    fn update(&mut self, counts: &StateCounts);

    /// Called when a command starts executing (not when skipped).
    fn task_started(&mut self, cmd: &Command);

    /// Called when a command reaches a terminal state.
    fn task_finished(&mut self, cmd: &Command, outcome: &Outcome);

    /// Log a line of output.
    fn log(&mut self, msg: &str);
}

/// Console reporting without overprinting: one line per started
/// command, failures with their captured stderr tail.
#[derive(Default)]
pub struct ConsoleProgress {
    /// Whether to print full command lines of started programs.
    verbose: bool,
}

impl ConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        ConsoleProgress { verbose }
    }
}

impl Progress for ConsoleProgress {
    fn update(&mut self, _counts: &StateCounts) {}

    fn task_started(&mut self, cmd: &Command) {
        if self.verbose {
            println!("{} {}", cmd.program(), cmd.argv().join(" "));
        } else if !cmd.is_silent() {
            println!("{}", cmd.display_name());
        }
    }

    fn task_finished(&mut self, cmd: &Command, outcome: &Outcome) {
        match outcome {
            Outcome::Skipped => {}
            Outcome::Succeeded { output } => {
                if !output.is_empty() && !cmd.is_silent() {
                    let mut stdout = std::io::stdout().lock();
                    let _ = std::io::Write::write_all(&mut stdout, output);
                }
            }
            Outcome::Failed { message } => {
                println!("failed: {}", cmd.display_name());
                println!("{}", message);
            }
        }
    }

    fn log(&mut self, msg: &str) {
        println!("{}", msg);
    }
}

/// Progress sink for tests and plan replays.
#[derive(Default)]
pub struct QuietProgress;

impl Progress for QuietProgress {
    fn update(&mut self, _counts: &StateCounts) {}
    fn task_started(&mut self, _cmd: &Command) {}
    fn task_finished(&mut self, _cmd: &Command, _outcome: &Outcome) {}
    fn log(&mut self, _msg: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_track_transitions() {
        let mut counts = StateCounts::default();
        counts.add(CmdState::Pending, 3);
        assert_eq!(counts.total(), 3);
        assert_eq!(counts.done(), 0);

        counts.sub(CmdState::Pending, 1);
        counts.add(CmdState::Ready, 1);
        counts.sub(CmdState::Ready, 1);
        counts.add(CmdState::Running, 1);
        counts.sub(CmdState::Running, 1);
        counts.add(CmdState::Succeeded, 1);
        assert_eq!(counts.total(), 3);
        assert_eq!(counts.done(), 1);
        assert_eq!(counts.get(CmdState::Pending), 2);
    }
}
