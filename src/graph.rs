//! The command graph: registration, dependency fixup, cycle detection.
//!
//! Commands live in an arena owned by the graph and refer to each other
//! by index, so the back-edge lists (dependents) never form ownership
//! cycles.  `finalize` derives the file-based edges: if command B reads
//! a file command A writes, A becomes a dependency of B.

use crate::command::Command;
use crate::error::{Error, Result};
use std::collections::HashMap;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CmdId(pub usize);

impl CmdId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Default)]
pub struct CommandGraph {
    commands: Vec<Command>,
    deps: Vec<Vec<CmdId>>,
    dependents: Vec<Vec<CmdId>>,
    /// Maps each output file to the unique command producing it.
    producer: HashMap<String, CmdId>,
    finalized: bool,
}

impl CommandGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command to the graph.  Every output must be unique across
    /// the graph; clashes are rejected at registration.
    pub fn register(&mut self, cmd: Command) -> Result<CmdId> {
        if self.finalized {
            return Err(Error::GraphFrozen);
        }
        let id = CmdId(self.commands.len());
        for output in cmd.outputs() {
            if let Some(&prev) = self.producer.get(output) {
                return Err(Error::DuplicateOutput {
                    file: output.to_owned(),
                    first: self.commands[prev.index()].name().to_owned(),
                    second: cmd.name().to_owned(),
                });
            }
        }
        for output in cmd.outputs() {
            self.producer.insert(output.to_owned(), id);
        }
        self.commands.push(cmd);
        self.deps.push(Vec::new());
        self.dependents.push(Vec::new());
        Ok(id)
    }

    /// Add an explicit ordering edge: `dep` must finish before `cmd`.
    pub fn add_dep(&mut self, cmd: CmdId, dep: CmdId) -> Result<()> {
        if self.finalized {
            return Err(Error::GraphFrozen);
        }
        self.deps[cmd.index()].push(dep);
        Ok(())
    }

    /// Derive input→output edges, build the back-edge lists, and reject
    /// cycles.  After this the graph is frozen.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        for id in 0..self.commands.len() {
            for input in self.commands[id].inputs() {
                if let Some(&producer) = self.producer.get(input) {
                    if producer.index() != id {
                        self.deps[id].push(producer);
                    }
                }
            }
            self.deps[id].sort_unstable();
            self.deps[id].dedup();
        }
        for id in 0..self.commands.len() {
            for &dep in &self.deps[id] {
                self.dependents[dep.index()].push(CmdId(id));
            }
        }
        self.check_cycles()?;
        self.finalized = true;
        Ok(())
    }

    /// Iterative three-color DFS; a back edge means a cycle, reported
    /// with the member command names.
    fn check_cycles(&self) -> Result<()> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;
        let mut color = vec![WHITE; self.commands.len()];

        for start in 0..self.commands.len() {
            if color[start] != WHITE {
                continue;
            }
            // Stack of (node, next dep index to visit).
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            color[start] = GRAY;
            loop {
                let Some(frame) = stack.last_mut() else {
                    break;
                };
                let node = frame.0;
                if frame.1 >= self.deps[node].len() {
                    color[node] = BLACK;
                    stack.pop();
                    continue;
                }
                let dep = self.deps[node][frame.1].index();
                frame.1 += 1;
                match color[dep] {
                    WHITE => {
                        color[dep] = GRAY;
                        stack.push((dep, 0));
                    }
                    GRAY => {
                        // The gray node is still on the stack; everything
                        // from its frame onward is the cycle.
                        let pos = stack.iter().position(|&(n, _)| n == dep).unwrap();
                        let members = stack[pos..]
                            .iter()
                            .map(|&(n, _)| self.commands[n].name().to_owned())
                            .collect();
                        return Err(Error::Cycle(members));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = CmdId> {
        (0..self.commands.len()).map(CmdId)
    }

    pub fn command(&self, id: CmdId) -> &Command {
        &self.commands[id.index()]
    }

    pub fn deps(&self, id: CmdId) -> &[CmdId] {
        &self.deps[id.index()]
    }

    pub fn dependents(&self, id: CmdId) -> &[CmdId] {
        &self.dependents[id.index()]
    }

    /// The command producing a file, if any command in the graph does.
    pub fn producer_of(&self, path: &str) -> Option<CmdId> {
        self.producer.get(&crate::canon::canon_path(path)).copied()
    }
}
