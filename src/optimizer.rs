use crate::delta::{Delta, Op};

/// Which operation kinds the optimizer may coalesce.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub merge_copy: bool,
    pub merge_insert: bool,
    pub merge_delete: bool,
    /// Advisory lower bound on merged run sizes; merging never gates on it.
    pub min_merged_size: u32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            merge_copy: true,
            merge_insert: true,
            merge_delete: true,
            min_merged_size: 1024,
        }
    }
}

/// Post-processes an operation stream: drops empties, coalesces contiguous
/// runs, and elides deletes that a following copy fully overwrites.
///
/// Coverage of the target is preserved exactly; only the shape of the
/// operation list changes.
pub struct Optimizer {
    config: OptimizerConfig,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn optimize(&self, delta: Delta) -> Delta {
        if delta.ops.is_empty() {
            return delta;
        }

        let ops: Vec<Op> = delta.ops.into_iter().filter(|op| !op.is_empty()).collect();
        let ops = self.merge_runs(ops);
        let ops = elide_redundant_deletes(ops);

        Delta { ops, ..delta }
    }

    /// Coalesce consecutive same-kind ops whose target ranges are contiguous;
    /// copies additionally require contiguous source ranges.
    fn merge_runs(&self, ops: Vec<Op>) -> Vec<Op> {
        let mut merged: Vec<Op> = Vec::with_capacity(ops.len());

        for op in ops {
            let absorbed = match merged.last_mut() {
                Some(prev) => self.try_merge(prev, &op),
                None => false,
            };
            if !absorbed {
                merged.push(op);
            }
        }

        merged
    }

    /// Fold `op` into `prev` when the pair forms a contiguous run of the same
    /// kind. Returns false when `op` must stand on its own.
    fn try_merge(&self, prev: &mut Op, op: &Op) -> bool {
        match (prev, op) {
            (
                Op::Copy {
                    offset: p_off,
                    src_offset: p_src,
                    len: p_len,
                },
                Op::Copy {
                    offset,
                    src_offset,
                    len,
                },
            ) if self.config.merge_copy
                && *p_off + u64::from(*p_len) == *offset
                && *p_src + u64::from(*p_len) == *src_offset =>
            {
                *p_len += len;
                true
            }
            (
                Op::Insert {
                    offset: p_off,
                    data: p_data,
                },
                Op::Insert { offset, data },
            ) if self.config.merge_insert && *p_off + p_data.len() as u64 == *offset => {
                p_data.extend_from_slice(data);
                true
            }
            (
                Op::Delete {
                    offset: p_off,
                    len: p_len,
                },
                Op::Delete { offset, len },
            ) if self.config.merge_delete && *p_off + u64::from(*p_len) == *offset => {
                *p_len += len;
                true
            }
            _ => false,
        }
    }
}

/// Drop each DELETE immediately followed by a COPY at the same target offset
/// covering at least the deleted range: the write fully overwrites it.
fn elide_redundant_deletes(ops: Vec<Op>) -> Vec<Op> {
    let mut filtered: Vec<Op> = Vec::with_capacity(ops.len());

    for i in 0..ops.len() {
        if let Op::Delete { offset, len } = &ops[i] {
            if let Some(Op::Copy {
                offset: c_off,
                len: c_len,
                ..
            }) = ops.get(i + 1)
            {
                if c_off == offset && c_len >= len {
                    continue;
                }
            }
        }
        filtered.push(ops[i].clone());
    }

    filtered
}
