//! Saved execution plans: a serialized command graph that can be
//! replayed without re-invoking any driver.
//!
//! The encoding is deterministic little-endian binary, version
//! prefixed: per command its identity hash, the full identity fields,
//! flags, and the identity hashes of its dependencies.  Saving the same
//! graph twice produces identical bytes.  Pools are runtime objects and
//! are not part of a plan.

use crate::command::{Command, MaybeUnused, RspFile};
use crate::error::{Error, Result};
use crate::graph::{CmdId, CommandGraph};
use std::collections::HashMap;
use std::path::Path;

const MAGIC: &[u8; 4] = b"bxpl";
const VERSION: u32 = 1;

pub fn save_execution_plan(graph: &CommandGraph, path: &Path) -> Result<()> {
    if !graph.is_finalized() {
        return Err(Error::Plan("graph must be finalized before saving".into()));
    }
    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    write_u32(&mut buf, VERSION);
    write_u32(&mut buf, graph.len() as u32);
    for id in graph.ids() {
        write_command(&mut buf, graph, id);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, buf)?;
    Ok(())
}

pub fn load_execution_plan(path: &Path) -> Result<CommandGraph> {
    let bytes = std::fs::read(path)?;
    let mut r = Reader {
        bytes: &bytes,
        pos: 0,
    };
    let magic = r.take(4)?;
    if magic != MAGIC {
        return Err(Error::Plan("bad magic".into()));
    }
    let version = r.read_u32()?;
    if version != VERSION {
        return Err(Error::Plan(format!("unsupported version {}", version)));
    }
    let count = r.read_u32()? as usize;

    let mut graph = CommandGraph::new();
    let mut by_identity: HashMap<u64, CmdId> = HashMap::new();
    let mut deps: Vec<(CmdId, Vec<u64>)> = Vec::with_capacity(count);
    for _ in 0..count {
        let (cmd, identity, dep_hashes) = read_command(&mut r)?;
        if cmd.identity() != identity {
            return Err(Error::Plan(format!(
                "identity mismatch for {}",
                cmd.name()
            )));
        }
        let id = graph.register(cmd)?;
        by_identity.insert(identity, id);
        deps.push((id, dep_hashes));
    }
    for (id, dep_hashes) in deps {
        for dep_hash in dep_hashes {
            let &dep = by_identity
                .get(&dep_hash)
                .ok_or_else(|| Error::Plan(format!("unknown dependency {:016x}", dep_hash)))?;
            graph.add_dep(id, dep)?;
        }
    }
    graph.finalize()?;
    Ok(graph)
}

fn write_command(buf: &mut Vec<u8>, graph: &CommandGraph, id: CmdId) {
    let cmd = graph.command(id);
    write_u64(buf, cmd.identity());
    write_str(buf, &cmd.name);
    write_str(buf, &cmd.name_short);
    write_str(buf, &cmd.program);
    write_strs(buf, cmd.args.iter().map(String::as_str));
    write_opt_str(buf, cmd.cwd.as_deref());
    write_u32(buf, cmd.env.len() as u32);
    for (k, v) in &cmd.env {
        write_str(buf, k);
        write_str(buf, v);
    }
    write_strs(buf, cmd.env_remove.iter().map(String::as_str));
    match &cmd.hash_env_allow {
        Some(allow) => {
            buf.push(1);
            write_strs(buf, allow.iter().map(String::as_str));
        }
        None => buf.push(0),
    }
    write_strs(buf, cmd.hash_env_deny.iter().map(String::as_str));
    write_strs(buf, cmd.inputs.iter().map(String::as_str));
    write_strs(buf, cmd.outputs.iter().map(String::as_str));
    write_strs(buf, cmd.intermediates.iter().map(String::as_str));
    write_opt_str(buf, cmd.stdin_file.as_deref());
    write_opt_str(buf, cmd.stdout_file.as_deref());
    write_opt_str(buf, cmd.stderr_file.as_deref());

    let mut flags: u8 = 0;
    for (i, set) in [
        cmd.always,
        cmd.silent,
        cmd.remove_outputs_before_execution,
        cmd.use_response_file,
        cmd.record_inputs_mtime,
        cmd.content_evidence,
    ]
    .into_iter()
    .enumerate()
    {
        if set {
            flags |= 1 << i;
        }
    }
    buf.push(flags);
    write_i32(buf, cmd.strict_order);
    buf.push(match cmd.maybe_unused {
        MaybeUnused::No => 0,
        MaybeUnused::Maybe => 1,
        MaybeUnused::Always => 2,
    });
    match &cmd.rsp {
        Some(rsp) => {
            buf.push(1);
            write_str(buf, &rsp.path);
            write_str(buf, &rsp.content);
        }
        None => buf.push(0),
    }

    let dep_ids = graph.deps(id);
    write_u32(buf, dep_ids.len() as u32);
    for &dep in dep_ids {
        write_u64(buf, graph.command(dep).identity());
    }
}

type ReadCommand = (Command, u64, Vec<u64>);

fn read_command(r: &mut Reader) -> Result<ReadCommand> {
    let identity = r.read_u64()?;
    let mut cmd = Command::new(r.read_str()?);
    cmd.name_short = r.read_str()?;
    cmd.program = r.read_str()?;
    cmd.args = r.read_strs()?;
    cmd.cwd = r.read_opt_str()?;
    let env_len = r.read_u32()? as usize;
    for _ in 0..env_len {
        let k = r.read_str()?;
        let v = r.read_str()?;
        cmd.env.insert(k, v);
    }
    cmd.env_remove = r.read_strs()?.into_iter().collect();
    cmd.hash_env_allow = match r.read_u8()? {
        0 => None,
        _ => Some(r.read_strs()?.into_iter().collect()),
    };
    cmd.hash_env_deny = r.read_strs()?.into_iter().collect();
    cmd.inputs = r.read_strs()?.into_iter().collect();
    cmd.outputs = r.read_strs()?.into_iter().collect();
    cmd.intermediates = r.read_strs()?.into_iter().collect();
    cmd.stdin_file = r.read_opt_str()?;
    cmd.stdout_file = r.read_opt_str()?;
    cmd.stderr_file = r.read_opt_str()?;

    let flags = r.read_u8()?;
    cmd.always = flags & (1 << 0) != 0;
    cmd.silent = flags & (1 << 1) != 0;
    cmd.remove_outputs_before_execution = flags & (1 << 2) != 0;
    cmd.use_response_file = flags & (1 << 3) != 0;
    cmd.record_inputs_mtime = flags & (1 << 4) != 0;
    cmd.content_evidence = flags & (1 << 5) != 0;
    cmd.strict_order = r.read_i32()?;
    cmd.maybe_unused = match r.read_u8()? {
        0 => MaybeUnused::No,
        1 => MaybeUnused::Maybe,
        2 => MaybeUnused::Always,
        other => return Err(Error::Plan(format!("bad maybe_unused {}", other))),
    };
    cmd.rsp = match r.read_u8()? {
        0 => None,
        _ => Some(RspFile {
            path: r.read_str()?,
            content: r.read_str()?,
        }),
    };
    // The plan was saved from a prepared graph.
    cmd.prepared = true;

    let dep_count = r.read_u32()? as usize;
    let mut dep_hashes = Vec::with_capacity(dep_count);
    for _ in 0..dep_count {
        dep_hashes.push(r.read_u64()?);
    }
    Ok((cmd, identity, dep_hashes))
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

fn write_opt_str(buf: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.push(1);
            write_str(buf, s);
        }
        None => buf.push(0),
    }
}

fn write_strs<'a>(buf: &mut Vec<u8>, strs: impl ExactSizeIterator<Item = &'a str>) {
    write_u32(buf, strs.len() as u32);
    for s in strs {
        write_str(buf, s);
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(Error::Plan("truncated plan".into()));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_str(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::Plan("non-utf8 string".into()))
    }

    fn read_opt_str(&mut self) -> Result<Option<String>> {
        match self.read_u8()? {
            0 => Ok(None),
            _ => Ok(Some(self.read_str()?)),
        }
    }

    fn read_strs(&mut self) -> Result<Vec<String>> {
        let count = self.read_u32()? as usize;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_str()?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_graph() -> CommandGraph {
        let mut graph = CommandGraph::new();

        let mut a = Command::new("generate header");
        a.set_program("gen");
        a.args(["-o", "out.h"]);
        a.add_input("in.txt");
        a.add_output("out.h");
        a.env("LANG", "C");
        a.set_strict_order(-1);
        graph.register(a).unwrap();

        let mut b = Command::new("compile");
        b.set_name_short("cc main");
        b.set_program("cc");
        b.args(["-c", "main.c"]);
        b.add_input("main.c");
        b.add_input("out.h");
        b.add_output("main.o");
        b.redirect_stderr("cc.err");
        b.set_record_inputs_mtime(true);
        b.set_maybe_unused(MaybeUnused::Maybe);
        graph.register(b).unwrap();

        graph.finalize().unwrap();
        graph
    }

    #[test]
    fn round_trip_preserves_bytes_and_edges() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.bin");
        let graph = sample_graph();
        save_execution_plan(&graph, &path)?;
        let first = std::fs::read(&path)?;

        let loaded = load_execution_plan(&path)?;
        assert_eq!(loaded.len(), graph.len());
        for id in graph.ids() {
            assert_eq!(
                loaded.command(id).identity(),
                graph.command(id).identity()
            );
            assert_eq!(loaded.deps(id), graph.deps(id));
        }

        let again = dir.path().join("plan2.bin");
        save_execution_plan(&loaded, &again)?;
        assert_eq!(first, std::fs::read(&again)?);
        Ok(())
    }

    #[test]
    fn unfinalized_graphs_cannot_be_saved() {
        let dir = tempfile::tempdir().unwrap();
        let graph = CommandGraph::new();
        assert!(save_execution_plan(&graph, &dir.path().join("p")).is_err());
    }

    #[test]
    fn corrupt_plans_are_rejected() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.bin");
        save_execution_plan(&sample_graph(), &path)?;

        let mut bytes = std::fs::read(&path)?;
        bytes.truncate(bytes.len() - 3);
        let truncated = dir.path().join("truncated.bin");
        std::fs::write(&truncated, &bytes)?;
        assert!(load_execution_plan(&truncated).is_err());

        std::fs::write(&truncated, b"nope")?;
        assert!(load_execution_plan(&truncated).is_err());
        Ok(())
    }
}
