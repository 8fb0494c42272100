//! CPU topology of a remote host, as a nested map of
//! socket -> core -> hardware threads.

use std::collections::BTreeMap;

use anyhow::{bail, Result};

/// socket id -> core id (ordinal within the socket) -> hardware thread ids.
pub type CpuTopology = BTreeMap<u32, BTreeMap<u32, Vec<u32>>>;

/// Parse `lscpu -p=cpu,core,socket` output. Comment lines (leading `#`) and
/// blank lines are skipped; empty input yields an empty map rather than an
/// error. Core ids are renumbered to be ordinal within each socket, so core 0
/// is always the first core of a socket regardless of global numbering.
pub fn parse_lscpu(output: &str) -> Result<CpuTopology> {
    // (socket, raw core id) -> threads, in first-seen order per socket.
    let mut raw: BTreeMap<u32, Vec<(u32, Vec<u32>)>> = BTreeMap::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split(',');
        let (cpu, core, socket) = match (fields.next(), fields.next(), fields.next()) {
            (Some(cpu), Some(core), Some(socket)) => (
                cpu.trim().parse::<u32>(),
                core.trim().parse::<u32>(),
                socket.trim().parse::<u32>(),
            ),
            _ => bail!("unparseable lscpu line {:?}", line),
        };
        let (cpu, core, socket) = match (cpu, core, socket) {
            (Ok(c), Ok(co), Ok(s)) => (c, co, s),
            _ => bail!("unparseable lscpu line {:?}", line),
        };

        let cores = raw.entry(socket).or_default();
        match cores.iter_mut().find(|(id, _)| *id == core) {
            Some((_, threads)) => threads.push(cpu),
            None => cores.push((core, vec![cpu])),
        }
    }

    let mut topology = CpuTopology::new();
    for (socket, cores) in raw {
        let socket_map: BTreeMap<u32, Vec<u32>> = cores
            .into_iter()
            .enumerate()
            .map(|(ordinal, (_, threads))| (ordinal as u32, threads))
            .collect();
        topology.insert(socket, socket_map);
    }
    Ok(topology)
}

/// Resolve a (core, socket, hyperthread) triple to a logical cpu id.
pub fn cpu_id(topology: &CpuTopology, core: u32, socket: u32, hyperthread: bool) -> Result<u32> {
    let thread = if hyperthread { 1 } else { 0 };
    topology
        .get(&socket)
        .and_then(|cores| cores.get(&core))
        .and_then(|threads| threads.get(thread))
        .copied()
        .ok_or_else(|| {
            anyhow::anyhow!(
                "core {}{} on socket {} does not exist",
                core,
                if hyperthread { "h" } else { "" },
                socket
            )
        })
}
