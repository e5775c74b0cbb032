//! Second dataflow pass, run after the peephole visitors reach a fixed
//! point: finds stack slots whose only consumer silently discards them and
//! removes the producer outright, shrinking whatever window consumed it.
//!
//! Scoped to a producer and its consumer living in the same flat block —
//! the same restriction spec.md §4.5 calls out for loop bodies ("produced
//! and consumed *inside* the loop body, otherwise the iteration count
//! matters") is applied uniformly to every block here, including
//! conditional branches, for tractability (see DESIGN.md). This only makes
//! the pass miss opportunities a tree-wide analysis would find; it never
//! makes it unsound, since a slot is only ever a candidate when this
//! block's own traversal watched it born and die without leaving.
//!
//! Producer-removal only applies to producers with no side effect — the
//! const-push family (`is_const_push`) — since anything else (`ACCEPT_N`,
//! `CALL`, `RULE`, ...) must still execute for its effect on `currPos` even
//! when its pushed value is unused. `PLUCK`/`CALL`'s inspected indices are
//! shifted to account for removed slots ahead of them in the same window.

use std::collections::HashMap;

use crate::bytecode::{Block, Element};
use crate::opcode::Opcode;

/// One stack position tracked while scanning a block: either a removable
/// producer (a const-push at `ip` that nothing has read yet) or a value of
/// unknown/ineligible provenance.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Producer { ip: usize },
    Opaque,
}

/// A discard window found while scanning: `consumer_ip` is `POP_N`, `PLUCK`,
/// or `CALL`; `removed_offsets` are the positions *within that window*
/// (0 = bottom of the discard window) whose producer is being deleted.
struct Window {
    consumer_ip: usize,
    removed_offsets: Vec<usize>,
    /// Element index of each removed producer, for deletion.
    removed_producers: Vec<usize>,
}

/// A single `NIP` whose "below top" slot is being eliminated; the `NIP`
/// itself becomes redundant once that slot's producer is gone.
struct DeadNip {
    nip_ip: usize,
    producer_ip: usize,
}

struct Findings {
    windows: Vec<Window>,
    nips: Vec<DeadNip>,
}

fn scan_block(block: &Block) -> Findings {
    let mut stack: Vec<Slot> = Vec::new();
    let mut windows = Vec::new();
    let mut nips = Vec::new();

    for (ip, element) in block.iter().enumerate() {
        let (op, args) = match element {
            Element::Flat { op, args } => (*op, args.as_slice()),
            // Conditionals and loops are an opaque boundary for this local
            // traversal: whatever is on the stack when we hit one might
            // be read inside, so forget it rather than risk a false dead
            // verdict. Their own bodies are scanned independently by the
            // caller's recursion.
            Element::Cond { .. } | Element::Loop { .. } => {
                stack.clear();
                continue;
            }
        };

        if op.is_const_push() {
            stack.push(Slot::Producer { ip });
            continue;
        }

        match op {
            Opcode::POP => {
                stack.pop();
            }
            Opcode::POP_N => {
                let n = args[0] as usize;
                let window = take_window(&mut stack, n);
                record_window(&mut windows, ip, window, &[]);
            }
            Opcode::NIP => {
                let top = stack.pop();
                let below = stack.pop();
                if let Some(Slot::Producer { ip: producer_ip }) = below {
                    nips.push(DeadNip { nip_ip: ip, producer_ip });
                }
                if let Some(top) = top {
                    stack.push(top);
                }
            }
            Opcode::PLUCK => {
                let n = args[0] as usize;
                let k = args[1] as usize;
                let kept: Vec<usize> = args[2..2 + k].iter().map(|&i| i as usize).collect();
                let window = take_window(&mut stack, n);
                record_window(&mut windows, ip, window, &kept);
                stack.push(Slot::Opaque);
            }
            Opcode::CALL => {
                let n = args[1] as usize;
                let pc = args[2] as usize;
                let kept: Vec<usize> = args[3..3 + pc].iter().map(|&i| i as usize).collect();
                let window = take_window(&mut stack, n);
                record_window(&mut windows, ip, window, &kept);
                stack.push(Slot::Opaque);
            }
            Opcode::POP_CURR_POS | Opcode::APPEND | Opcode::TEXT => {
                stack.pop();
                if matches!(op, Opcode::APPEND) {
                    // The array slot survives (grows in place); nothing new
                    // to push, nothing eligible to remove.
                } else if matches!(op, Opcode::TEXT) {
                    stack.push(Slot::Opaque);
                }
            }
            Opcode::WRAP => {
                let n = args[0] as usize;
                take_window(&mut stack, n); // every member is used, none removable
                stack.push(Slot::Opaque);
            }
            Opcode::ACCEPT_N | Opcode::ACCEPT_STRING | Opcode::RULE | Opcode::FAIL => {
                stack.push(Slot::Opaque);
            }
            Opcode::LOAD_SAVED_POS
            | Opcode::UPDATE_SAVED_POS
            | Opcode::SILENT_FAILS_ON
            | Opcode::SILENT_FAILS_OFF
            | Opcode::SOURCE_MAP_PUSH
            | Opcode::SOURCE_MAP_POP
            | Opcode::SOURCE_MAP_LABEL_PUSH
            | Opcode::SOURCE_MAP_LABEL_POP => {}
            _ => unreachable!("structural or const-push opcode handled above"),
        }
    }

    Findings { windows, nips }
}

fn take_window(stack: &mut Vec<Slot>, n: usize) -> Vec<Slot> {
    let start = stack.len().saturating_sub(n);
    stack.split_off(start)
}

fn record_window(windows: &mut Vec<Window>, consumer_ip: usize, window: Vec<Slot>, kept: &[usize]) {
    let mut removed_offsets = Vec::new();
    let mut removed_producers = Vec::new();
    for (offset, slot) in window.iter().enumerate() {
        if kept.contains(&offset) {
            continue;
        }
        if let Slot::Producer { ip } = slot {
            removed_offsets.push(offset);
            removed_producers.push(*ip);
        }
    }
    if !removed_producers.is_empty() {
        windows.push(Window { consumer_ip, removed_offsets, removed_producers });
    }
}

/// How many of `removed_offsets` sit strictly before `index` — the amount a
/// window-relative index needs to shift down once those slots are gone.
fn shift_for(removed_offsets: &[usize], index: usize) -> usize {
    removed_offsets.iter().filter(|&&o| o < index).count()
}

fn rewrite_block(block: &mut Block, findings: Findings) -> bool {
    if findings.windows.is_empty() && findings.nips.is_empty() {
        return false;
    }

    let mut removed_elements: HashMap<usize, ()> = HashMap::new();
    let mut n_adjust: HashMap<usize, usize> = HashMap::new();
    let mut index_shift: HashMap<usize, Vec<usize>> = HashMap::new();

    for window in &findings.windows {
        for &ip in &window.removed_producers {
            removed_elements.insert(ip, ());
        }
        *n_adjust.entry(window.consumer_ip).or_insert(0) += window.removed_offsets.len();
        index_shift.insert(window.consumer_ip, window.removed_offsets.clone());
    }
    for nip in &findings.nips {
        removed_elements.insert(nip.producer_ip, ());
        removed_elements.insert(nip.nip_ip, ());
    }

    let mut out = Vec::with_capacity(block.len());
    for (ip, element) in block.drain(..).enumerate() {
        if removed_elements.contains_key(&ip) {
            continue;
        }
        let Some(removed) = n_adjust.get(&ip) else {
            out.push(element);
            continue;
        };
        let Element::Flat { op, mut args } = element else {
            out.push(element);
            continue;
        };
        let offsets = &index_shift[&ip];
        match op {
            Opcode::POP_N => {
                args[0] -= *removed as i64;
            }
            Opcode::PLUCK => {
                args[0] -= *removed as i64;
                let k = args[1] as usize;
                for pi in &mut args[2..2 + k] {
                    *pi -= shift_for(offsets, *pi as usize) as i64;
                }
            }
            Opcode::CALL => {
                args[1] -= *removed as i64;
                let pc = args[2] as usize;
                for pi in &mut args[3..3 + pc] {
                    *pi -= shift_for(offsets, *pi as usize) as i64;
                }
            }
            _ => unreachable!("only POP_N/PLUCK/CALL ever appear as window consumers"),
        }
        out.push(Element::Flat { op, args });
    }
    *block = out;
    true
}

/// Collapse `SILENT_FAILS_ON`/`OFF` pairs whose interior never touches
/// `CALL`, `FAIL`, or `RULE` — nothing between them can ever register an
/// entry in the host VM's expectation table, so the pair has no observable
/// effect and both markers become `POP_N 0` placeholders.
fn collapse_inert_silent_fails(block: &mut Block) -> bool {
    let mut changed = false;
    let mut on_stack: Vec<usize> = Vec::new();
    let mut pairs = Vec::new();
    for (ip, element) in block.iter().enumerate() {
        if let Element::Flat { op: Opcode::SILENT_FAILS_ON, .. } = element {
            on_stack.push(ip);
        } else if let Element::Flat { op: Opcode::SILENT_FAILS_OFF, .. } = element {
            if let Some(on_ip) = on_stack.pop() {
                pairs.push((on_ip, ip));
            }
        }
    }
    for (on_ip, off_ip) in pairs {
        if on_ip + 1 < off_ip && !contains_effectful_op(&block[on_ip + 1..off_ip]) {
            block[on_ip] = Element::flat(Opcode::POP_N, [0]);
            block[off_ip] = Element::flat(Opcode::POP_N, [0]);
            changed = true;
        }
    }
    changed
}

fn contains_effectful_op(elements: &[Element]) -> bool {
    elements.iter().any(|el| match el {
        Element::Flat { op, .. } => {
            matches!(op, Opcode::CALL | Opcode::FAIL | Opcode::RULE)
        }
        Element::Cond { then_block, else_block, .. } => {
            contains_effectful_op(then_block) || contains_effectful_op(else_block)
        }
        Element::Loop { body } => contains_effectful_op(body),
    })
}

/// Run the dead-slot pass once over `block` and every nested block,
/// returning whether anything was rewritten.
pub fn remove_dead_slots(block: &mut Block) -> bool {
    let findings = scan_block(block);
    let mut changed = rewrite_block(block, findings);
    changed |= collapse_inert_silent_fails(block);

    for element in block.iter_mut() {
        match element {
            Element::Cond { then_block, else_block, .. } => {
                changed |= remove_dead_slots(then_block);
                changed |= remove_dead_slots(else_block);
            }
            Element::Loop { body } => {
                changed |= remove_dead_slots(body);
            }
            Element::Flat { .. } => {}
        }
    }
    changed
}
