use itertools::Itertools;

use crate::backend::{complex_scalar, Backend, Scope, SymbolTable};
use crate::common::{ElemType, Error, Result};
use crate::ir::{sweep_identity, Instruction, Opcode, Operand, View};
use crate::passes::{Block, LoopBlock};

/// Placeholder for the kernel entry-point name. The engine fingerprints
/// the emitted text as-is, then substitutes `<kernel_prefix><digest>`
/// before the source reaches the compiler, so the name can embed the hash
/// of the text it appears in.
pub const KERNEL_NAME: &str = "@KERNEL@";

/// Emit complete kernel source for a fused block tree.
pub fn emit_kernel(
    root: &LoopBlock,
    symbols: &SymbolTable,
    backend: &dyn Backend,
) -> Result<String> {
    let mut out = String::new();
    out.push_str(&format!("// backend: {:?}\n", backend.kind()).to_lowercase());
    out.push_str(&format!("// flags: {}\n", backend.flags()));
    backend.preamble(root.uses_random(), &mut out);

    let sig = signature(symbols, backend);
    if backend.is_device() {
        out.push_str(&format!("__kernel void {KERNEL_NAME}({sig}) {{\n"));
        write_block(symbols, backend, None, root, false, &mut out)?;
        out.push_str("}\n");
    } else {
        out.push_str(&format!("static void kernel_body({sig}) {{\n"));
        write_block(symbols, backend, None, root, false, &mut out)?;
        out.push_str("}\n\n");
        write_launcher(symbols, backend, &mut out);
    }
    Ok(out)
}

/// Kernel parameter list: base pointers, then per offset/stride view one
/// `uint64` offset plus per-axis `uint64` strides, then one `const T` per
/// kernel-argument constant.
fn signature(symbols: &SymbolTable, backend: &dyn Backend) -> String {
    let u64t = backend.write_type(ElemType::UInt64);
    let mut parts: Vec<String> = Vec::new();
    for base in symbols.params() {
        parts.push(format!(
            "{}{}* {} a{}",
            backend.array_qualifier(),
            backend.write_type(symbols.dtype(base)),
            backend.restrict_kw(),
            symbols.base_id(base).unwrap()
        ));
    }
    for view in symbols.offset_stride_views() {
        let k = symbols.offset_strides_id(view).unwrap();
        parts.push(format!("{u64t} vo{k}"));
        for i in 0..view.ndim() {
            parts.push(format!("{u64t} vs{k}_{i}"));
        }
    }
    for (cid, c) in symbols.consts() {
        parts.push(format!("const {} c{cid}", backend.write_type(c.dtype())));
    }
    parts.iter().join(", ")
}

/// The exported `void (void**)` entry point unpacking the flat argument
/// vector into the typed kernel, in signature order.
fn write_launcher(symbols: &SymbolTable, backend: &dyn Backend, out: &mut String) {
    let u64t = backend.write_type(ElemType::UInt64);
    let mut unpack: Vec<String> = Vec::new();
    let mut n = 0usize;
    for base in symbols.params() {
        unpack.push(format!("({}*)args[{n}]", backend.write_type(symbols.dtype(base))));
        n += 1;
    }
    for view in symbols.offset_stride_views() {
        unpack.push(format!("*({u64t}*)args[{n}]"));
        n += 1;
        for _ in 0..view.ndim() {
            unpack.push(format!("*({u64t}*)args[{n}]"));
            n += 1;
        }
    }
    for (_, c) in symbols.consts() {
        unpack.push(format!("*(const {}*)args[{n}]", backend.write_type(c.dtype())));
        n += 1;
    }
    out.push_str(&format!("void {KERNEL_NAME}(void** args) {{\n"));
    if unpack.is_empty() {
        out.push_str("    (void)args;\n    kernel_body();\n");
    } else {
        out.push_str(&format!("    kernel_body({});\n", unpack.iter().join(", ")));
    }
    out.push_str("}\n");
}

fn indent_for(rank: i64) -> String {
    " ".repeat((4 * (rank + 2)).max(0) as usize)
}

/// One loop level, in order: temp declarations, index declarations,
/// sweep-output initialisation and scalar replacement, duplicate scalar
/// replacement, body, write-back of scalar-replaced outputs.
fn write_block(
    symbols: &SymbolTable,
    backend: &dyn Backend,
    parent: Option<&Scope<'_>>,
    lp: &LoopBlock,
    in_parallel: bool,
    out: &mut String,
) -> Result<()> {
    let ind = indent_for(lp.rank);
    if lp.is_system_only() {
        out.push_str(&ind);
        out.push_str("// Removed loop with only system instructions\n");
        return Ok(());
    }
    let mut scope = Scope::new(parent);

    // Temp declarations.
    for instr in lp.all_instrs() {
        if instr.opcode.is_system() {
            continue;
        }
        for view in instr.views() {
            if lp.local_temps.contains(&view.base)
                && symbols.is_temp(view.base)
                && !scope.is_declared(view)
                && !symbols.is_always_array(view.base)
            {
                scope.insert_tmp(view.base, view);
                out.push_str(&format!(
                    "{ind}{} t{};\n",
                    backend.write_type(symbols.dtype(view.base)),
                    view.base.0
                ));
            }
        }
    }

    // Index declarations, only inside loops.
    if lp.rank >= 0 {
        let u64t = backend.write_type(ElemType::UInt64);
        for instr in lp.local_instrs() {
            if instr.opcode.is_system() {
                continue;
            }
            for (i, op) in instr.operands.iter().enumerate() {
                let Some(view) = op.view() else { continue };
                let Some(n) = symbols.idx_id(view) else { continue };
                if scope.is_array(view) && !scope.is_idx_declared(view) {
                    scope.insert_idx(view);
                    let hidden = hidden_axis(instr, i);
                    out.push_str(&format!(
                        "{ind}{u64t} idx{n} = {};\n",
                        subscription_expr(symbols, view, hidden)
                    ));
                }
            }
        }
    }

    // Initialise sweep outputs whose fold loop is a direct child; the
    // innermost-axis reduction becomes a scalar accumulator.
    for child in &lp.children {
        let Block::Loop(b1) = child else { continue };
        for instr in b1.all_instrs() {
            if !instr.opcode.is_reduction() {
                continue;
            }
            let Some(axis) = instr.sweep_axis() else { continue };
            if axis != b1.rank {
                continue;
            }
            let view = instr.operands[0].view().unwrap();
            let dtype = symbols.dtype(view.base);
            let identity = backend.write_constant(&sweep_identity(instr.opcode, dtype)?);
            let in_ndim = instr.operands[1].view().unwrap().ndim();
            let innermost = axis as usize == in_ndim - 1;
            if innermost && !scope.is_declared(view) && !symbols.is_always_array(view.base) {
                scope.insert_scalar_replaced(view);
                let n = symbols.idx_id(view).expect("sweep output is a parameter view");
                out.push_str(&format!(
                    "{ind}{} s{n} = {identity}; // reduction accumulator\n",
                    backend.write_type(dtype)
                ));
            } else {
                write_reduction_init(symbols, backend, &scope, instr, &identity, &ind, out);
            }
        }
    }

    // Scalar replacement of views read or written more than once at this
    // level. Sweep storage and always-array bases keep their memory form.
    {
        let mut ignore: std::collections::HashSet<crate::ir::BaseId> =
            std::collections::HashSet::new();
        for instr in lp.all_instrs() {
            if instr.opcode.is_accumulation() {
                if let Some(v) = instr.operands[1].view() {
                    ignore.insert(v.base);
                }
            }
            if instr.opcode.is_reduction() {
                for op in &instr.operands[..2] {
                    if let Some(v) = op.view() {
                        ignore.insert(v.base);
                    }
                }
            }
            for view in instr.views() {
                if symbols.is_always_array(view.base) {
                    ignore.insert(view.base);
                }
            }
        }
        let mut candidates: std::collections::HashSet<View> = std::collections::HashSet::new();
        for instr in lp.local_instrs() {
            if instr.opcode.is_system() {
                continue;
            }
            for (i, op) in instr.operands.iter().enumerate() {
                let Some(view) = op.view() else { continue };
                if ignore.contains(&view.base) || scope.is_declared(view) {
                    continue;
                }
                if candidates.contains(view) {
                    scope.insert_scalar_replaced(view);
                    let n = symbols.idx_id(view).expect("replaced view is a parameter view");
                    out.push_str(&format!(
                        "{ind}{} s{n};",
                        backend.write_type(symbols.dtype(view.base))
                    ));
                    if !(i == 0 && instr.constructor) {
                        out.push_str(&format!(
                            " s{n} = a{}{};",
                            symbols.base_id(view.base).unwrap(),
                            subscript(&scope, symbols, view, hidden_axis(instr, i))
                        ));
                    }
                    out.push_str(" // duplicate access\n");
                } else {
                    candidates.insert(view.clone());
                }
            }
        }
    }

    // Body: leaf instructions and nested loops.
    for child in &lp.children {
        match child {
            Block::Instr(instr) => {
                if instr.opcode.is_system() {
                    continue;
                }
                if !backend.is_device() && in_parallel {
                    if let Some(pragma) = sync_pragma(symbols, instr) {
                        out.push_str(&ind);
                        out.push_str(pragma);
                    }
                }
                out.push_str(&ind);
                write_instr(&scope, symbols, backend, instr, out)?;
            }
            Block::Loop(b1) => {
                let parallel =
                    b1.rank == 0 && backend.wants_parallel() && !b1.has_accumulate_along(0);
                let braces = backend.loop_head(b1, parallel, &ind, out);
                write_block(symbols, backend, Some(&scope), b1, in_parallel || parallel, out)?;
                for _ in 0..braces {
                    out.push_str(&ind);
                    out.push_str("}\n");
                }
            }
        }
    }

    // Write scalar-replaced outputs back to their arrays.
    for instr in lp.all_instrs() {
        let Some(view) = instr.operands.first().and_then(|o| o.view()) else {
            continue;
        };
        if instr.opcode == Opcode::Free || !scope.is_scalar_replaced_here(view) {
            continue;
        }
        let hidden = if instr.opcode.is_reduction() { instr.sweep_axis() } else { None };
        let n = symbols.idx_id(view).unwrap();
        out.push_str(&format!(
            "{ind}a{}{} = s{n};\n",
            symbols.base_id(view.base).unwrap(),
            subscript(&scope, symbols, view, hidden)
        ));
        scope.erase_scalar_replaced(view);
    }
    Ok(())
}

/// Identity store for a sweep output that stays in memory (or in a temp
/// scalar): a single element for innermost sweeps, an init loop nest over
/// the surviving axes otherwise.
fn write_reduction_init(
    symbols: &SymbolTable,
    backend: &dyn Backend,
    scope: &Scope<'_>,
    instr: &Instruction,
    identity: &str,
    ind: &str,
    out: &mut String,
) {
    let view = instr.operands[0].view().unwrap();
    let axis = instr.sweep_axis().unwrap();
    if scope.is_tmp(view.base) {
        out.push_str(&format!("{ind}t{} = {identity};\n", view.base.0));
        return;
    }
    if scope.is_scalar_replaced(view) {
        let n = symbols.idx_id(view).unwrap();
        out.push_str(&format!("{ind}s{n} = {identity};\n"));
        return;
    }
    let base = symbols.base_id(view.base).unwrap();
    let in_ndim = instr.operands[1].view().unwrap().ndim();
    let store = format!(
        "a{base}[{}] = {identity};",
        subscription_expr(symbols, view, Some(axis))
    );
    if axis as usize == in_ndim - 1 {
        out.push_str(&format!("{ind}{store}\n"));
        return;
    }
    // The fold axis is not innermost: the surviving inner axes need their
    // own init loops before the main nest runs.
    let u64t = backend.write_type(ElemType::UInt64);
    let first = axis as usize;
    let last = in_ndim - 1; // out has in_ndim-1 real axes
    let mut pad = ind.to_string();
    for j in first..last {
        let r = j + 1;
        out.push_str(&format!(
            "{pad}for ({u64t} i{r} = 0; i{r} < {}; ++i{r}) {{\n",
            view.shape[j]
        ));
        pad.push_str("    ");
    }
    out.push_str(&format!("{pad}{store}\n"));
    for _ in first..last {
        pad.truncate(pad.len() - 4);
        out.push_str(&format!("{pad}}}\n"));
    }
}

/// The sweep axis is hidden from a reduction output's index expression.
fn hidden_axis(instr: &Instruction, operand_index: usize) -> Option<i64> {
    if operand_index == 0 && instr.opcode.is_reduction() {
        instr.sweep_axis()
    } else {
        None
    }
}

/// `vo{k} + i{r}*vs{k}_{j} + …` without brackets. For reduction outputs
/// the sweep axis is removed from the axis-variable mapping; a fully
/// reduced output collapses to its offset.
fn subscription_expr(symbols: &SymbolTable, view: &View, hidden: Option<i64>) -> String {
    let k = symbols.offset_strides_id(view).expect("subscripted view is a parameter view");
    let mut expr = format!("vo{k}");
    if hidden.is_some() && view.nelem() == 1 {
        return expr;
    }
    for j in 0..view.ndim() {
        let r = match hidden {
            Some(h) if j as i64 >= h => j + 1,
            _ => j,
        };
        expr.push_str(&format!(" + i{r}*vs{k}_{j}"));
    }
    expr
}

/// `[idx{n}]` when the index local is in scope, else the full expression.
fn subscript(
    scope: &Scope<'_>,
    symbols: &SymbolTable,
    view: &View,
    hidden: Option<i64>,
) -> String {
    if scope.is_idx_declared(view) {
        format!("[idx{}]", symbols.idx_id(view).unwrap())
    } else {
        format!("[{}]", subscription_expr(symbols, view, hidden))
    }
}

/// Expression form of one view operand.
fn operand_str(
    scope: &Scope<'_>,
    symbols: &SymbolTable,
    view: &View,
    hidden: Option<i64>,
) -> String {
    if scope.is_tmp(view.base) || scope.is_scalar_replaced(view) {
        scope.name(view, symbols)
    } else {
        format!(
            "a{}{}",
            symbols.base_id(view.base).unwrap(),
            subscript(scope, symbols, view, hidden)
        )
    }
}

/// OpenMP pragma for a contended sweep: the fold runs along the parallel
/// rank, so every thread updates the same output element.
fn sync_pragma(symbols: &SymbolTable, instr: &Instruction) -> Option<&'static str> {
    if !instr.opcode.is_reduction() || instr.sweep_axis() != Some(0) {
        return None;
    }
    let t0 = symbols.operand_type(instr, 0);
    let atomic = !t0.is_complex()
        && matches!(
            instr.opcode,
            Opcode::AddReduce
                | Opcode::MultiplyReduce
                | Opcode::BitwiseAndReduce
                | Opcode::BitwiseOrReduce
                | Opcode::BitwiseXorReduce
        );
    Some(if atomic { "#pragma omp atomic\n" } else { "#pragma omp critical\n" })
}

/// Build the operand strings and emit one instruction statement.
fn write_instr(
    scope: &Scope<'_>,
    symbols: &SymbolTable,
    backend: &dyn Backend,
    instr: &Instruction,
    out: &mut String,
) -> Result<()> {
    let ops = build_ops(scope, symbols, backend, instr)?;
    write_operation(instr, &ops, symbols, backend, out)
}

fn build_ops(
    scope: &Scope<'_>,
    symbols: &SymbolTable,
    backend: &dyn Backend,
    instr: &Instruction,
) -> Result<Vec<String>> {
    match instr.opcode {
        Opcode::Range => {
            let view = instr.operands[0].view().unwrap();
            Ok(vec![operand_str(scope, symbols, view, None), flat_index(&view.shape)])
        }
        Opcode::Random => {
            let view = instr.operands[0].view().unwrap();
            let Some(crate::ir::Constant::R123 { start, key }) = instr.constant else {
                return Err(Error::Structural("RANDOM without an r123 constant".into())
                    .with_instr(&instr.to_string()));
            };
            let start_lit = backend.write_constant(&crate::ir::Constant::UInt64(start));
            let key_lit = backend.write_constant(&crate::ir::Constant::UInt64(key));
            Ok(vec![
                operand_str(scope, symbols, view, None),
                format!("util_random123({start_lit} + ({}), {key_lit})", flat_index(&view.shape)),
            ])
        }
        Opcode::Gather => {
            let out_v = instr.operands[0].view().unwrap();
            let in_v = instr.operands[1].view().unwrap();
            let idx_v = instr.operands[2].view().unwrap();
            Ok(vec![
                operand_str(scope, symbols, out_v, None),
                format!(
                    "a{}[vo{} + {}]",
                    symbols.base_id(in_v.base).unwrap(),
                    symbols.offset_strides_id(in_v).unwrap(),
                    operand_str(scope, symbols, idx_v, None)
                ),
            ])
        }
        Opcode::Scatter | Opcode::CondScatter => {
            let out_v = instr.operands[0].view().unwrap();
            let in_v = instr.operands[1].view().unwrap();
            let idx_v = instr.operands[2].view().unwrap();
            let mut ops = vec![
                format!(
                    "a{}[vo{} + {}]",
                    symbols.base_id(out_v.base).unwrap(),
                    symbols.offset_strides_id(out_v).unwrap(),
                    operand_str(scope, symbols, idx_v, None)
                ),
                operand_str(scope, symbols, in_v, None),
            ];
            if instr.opcode == Opcode::CondScatter {
                let mask = instr.operands[3].view().unwrap();
                ops.push(operand_str(scope, symbols, mask, None));
            }
            Ok(ops)
        }
        _ if instr.opcode.is_accumulation() => {
            let out_v = instr.operands[0].view().unwrap();
            let in_v = instr.operands[1].view().unwrap();
            let axis = instr.sweep_axis().unwrap();
            let j = axis as usize;
            let k = symbols.offset_strides_id(out_v).expect("accumulate output stays an array");
            let identity = backend
                .write_constant(&sweep_identity(instr.opcode, symbols.dtype(out_v.base))?);
            let base = symbols.base_id(out_v.base).unwrap();
            let prev = if scope.is_idx_declared(out_v) {
                format!("a{base}[idx{} - vs{k}_{j}]", symbols.idx_id(out_v).unwrap())
            } else {
                format!("a{base}[{} - vs{k}_{j}]", subscription_expr(symbols, out_v, None))
            };
            Ok(vec![
                operand_str(scope, symbols, out_v, None),
                format!("((i{j} == 0) ? {identity} : {prev})"),
                operand_str(scope, symbols, in_v, None),
            ])
        }
        _ => {
            let mut ops = Vec::with_capacity(instr.operands.len());
            for (i, op) in instr.operands.iter().enumerate() {
                match op {
                    Operand::View(view) => {
                        ops.push(operand_str(scope, symbols, view, hidden_axis(instr, i)));
                    }
                    Operand::Const => match symbols.const_id(instr.seq) {
                        Some(cid) => ops.push(format!("c{cid}")),
                        None => match &instr.constant {
                            Some(c) => ops.push(backend.write_constant(c)),
                            None => ops.push(String::new()),
                        },
                    },
                }
            }
            Ok(ops)
        }
    }
}

/// Flat iteration index of a contiguous view: `i0*s1 + i1*s2 + … + ik`.
fn flat_index(shape: &[i64]) -> String {
    let mut terms = Vec::with_capacity(shape.len());
    for j in 0..shape.len() {
        let mult: i64 = shape[j + 1..].iter().product();
        if mult == 1 {
            terms.push(format!("i{j}"));
        } else {
            terms.push(format!("i{j}*{mult}"));
        }
    }
    terms.join(" + ")
}

fn sign_expr(operand: &str) -> String {
    format!("(({operand} > 0) - (0 > {operand}))")
}

/// Per-opcode emission templates over the operand strings.
fn write_operation(
    instr: &Instruction,
    ops: &[String],
    symbols: &SymbolTable,
    backend: &dyn Backend,
    out: &mut String,
) -> Result<()> {
    use Opcode::*;
    let opencl = backend.is_device();
    let line = match instr.opcode {
        BitwiseAnd => format!("{} = {} & {};", ops[0], ops[1], ops[2]),
        BitwiseAndReduce => format!("{} = {} & {};", ops[0], ops[0], ops[1]),
        BitwiseOr => format!("{} = {} | {};", ops[0], ops[1], ops[2]),
        BitwiseOrReduce => format!("{} = {} | {};", ops[0], ops[0], ops[1]),
        BitwiseXor => format!("{} = {} ^ {};", ops[0], ops[1], ops[2]),
        BitwiseXorReduce => format!("{} = {} ^ {};", ops[0], ops[0], ops[1]),
        LogicalNot => format!("{} = !{};", ops[0], ops[1]),
        LogicalOr => format!("{} = {} || {};", ops[0], ops[1], ops[2]),
        LogicalOrReduce => format!("{} = {} || {};", ops[0], ops[0], ops[1]),
        LogicalAnd => format!("{} = {} && {};", ops[0], ops[1], ops[2]),
        LogicalAndReduce => format!("{} = {} && {};", ops[0], ops[0], ops[1]),
        LogicalXor => format!("{} = !{} != !{};", ops[0], ops[1], ops[2]),
        LogicalXorReduce => format!("{} = !{} != !{};", ops[0], ops[0], ops[1]),
        LeftShift => format!("{} = {} << {};", ops[0], ops[1], ops[2]),
        RightShift => format!("{} = {} >> {};", ops[0], ops[1], ops[2]),
        Greater => format!("{} = {} > {};", ops[0], ops[1], ops[2]),
        GreaterEqual => format!("{} = {} >= {};", ops[0], ops[1], ops[2]),
        Less => format!("{} = {} < {};", ops[0], ops[1], ops[2]),
        LessEqual => format!("{} = {} <= {};", ops[0], ops[1], ops[2]),
        Maximum => {
            format!("{} = {} > {} ? {} : {};", ops[0], ops[1], ops[2], ops[1], ops[2])
        }
        MaximumReduce => {
            format!("{} = {} > {} ? {} : {};", ops[0], ops[0], ops[1], ops[0], ops[1])
        }
        Minimum => {
            format!("{} = {} < {} ? {} : {};", ops[0], ops[1], ops[2], ops[1], ops[2])
        }
        MinimumReduce => {
            format!("{} = {} < {} ? {} : {};", ops[0], ops[0], ops[1], ops[0], ops[1])
        }
        Invert => {
            if symbols.operand_type(instr, 0) == ElemType::Bool {
                format!("{} = !{};", ops[0], ops[1])
            } else {
                format!("{} = ~{};", ops[0], ops[1])
            }
        }
        Mod => {
            if symbols.operand_type(instr, 0).is_float() {
                format!("{} = fmod({}, {});", ops[0], ops[1], ops[2])
            } else {
                format!("{} = {} % {};", ops[0], ops[1], ops[2])
            }
        }
        Remainder => {
            let t0 = symbols.operand_type(instr, 0);
            if t0.is_float() {
                format!(
                    "{} = {} - floor({} / {}) * {};",
                    ops[0], ops[1], ops[1], ops[2], ops[2]
                )
            } else if t0.is_unsigned_integer() {
                format!("{} = {} % {};", ops[0], ops[1], ops[2])
            } else {
                // NumPy sign-correcting remainder on signed integers.
                format!(
                    "{} = (({} > 0) == ({} > 0) || ({} % {}) == 0) ? \
                     ({} % {}) : ({} % {}) + {};",
                    ops[0], ops[1], ops[2], ops[1], ops[2], ops[1], ops[2], ops[1], ops[2],
                    ops[2]
                )
            }
        }
        Rint => format!("{} = rint({});", ops[0], ops[1]),
        Exp2 => format!("{} = exp2({});", ops[0], ops[1]),
        Expm1 => format!("{} = expm1({});", ops[0], ops[1]),
        Log1p => format!("{} = log1p({});", ops[0], ops[1]),
        Arcsin => format!("{} = asin({});", ops[0], ops[1]),
        Arccos => format!("{} = acos({});", ops[0], ops[1]),
        Arctan => format!("{} = atan({});", ops[0], ops[1]),
        Arctan2 => format!("{} = atan2({}, {});", ops[0], ops[1], ops[2]),
        Arcsinh => format!("{} = asinh({});", ops[0], ops[1]),
        Arccosh => format!("{} = acosh({});", ops[0], ops[1]),
        Arctanh => format!("{} = atanh({});", ops[0], ops[1]),
        Floor => format!("{} = floor({});", ops[0], ops[1]),
        Ceil => format!("{} = ceil({});", ops[0], ops[1]),
        Trunc => format!("{} = trunc({});", ops[0], ops[1]),
        Log2 => format!("{} = log2({});", ops[0], ops[1]),
        Isnan | Isinf | Isfinite => {
            let fname = match instr.opcode {
                Isnan => "isnan",
                Isinf => "isinf",
                _ => "isfinite",
            };
            let t1 = symbols.operand_type(instr, 1);
            if t1.is_complex() {
                if opencl {
                    format!("{} = {fname}({}.x);", ops[0], ops[1])
                } else {
                    format!("{} = {fname}(creal({}));", ops[0], ops[1])
                }
            } else if t1.is_float() {
                format!("{} = {fname}({});", ops[0], ops[1])
            } else if instr.opcode == Isfinite {
                format!("{} = true;", ops[0])
            } else {
                format!("{} = false;", ops[0])
            }
        }
        Conj => {
            if opencl {
                format!("{} = {}; {}.y *= -1;", ops[0], ops[1], ops[0])
            } else {
                format!("{} = conj({});", ops[0], ops[1])
            }
        }
        Range | Random => format!("{} = {};", ops[0], ops[1]),
        Sin | Cos | Tan | Sinh | Cosh | Tanh | Exp => {
            let (fname, cname) = match instr.opcode {
                Sin => ("sin", "CSIN"),
                Cos => ("cos", "CCOS"),
                Tan => ("tan", "CTAN"),
                Sinh => ("sinh", "CSINH"),
                Cosh => ("cosh", "CCOSH"),
                Tanh => ("tanh", "CTANH"),
                _ => ("exp", "CEXP"),
            };
            let t0 = symbols.operand_type(instr, 0);
            if opencl && t0.is_complex() {
                format!("{cname}({}, {}, {});", complex_scalar(t0), ops[0], ops[1])
            } else {
                format!("{} = {fname}({});", ops[0], ops[1])
            }
        }
        Absolute => {
            let t1 = symbols.operand_type(instr, 1);
            if t1 == ElemType::Bool || t1.is_unsigned_integer() {
                format!("{} = {};", ops[0], ops[1]) // no-op
            } else if opencl && t1.is_complex() {
                format!("CABS({}, {});", ops[0], ops[1])
            } else if t1.is_float() {
                format!("{} = fabs({});", ops[0], ops[1])
            } else if !opencl && t1 == ElemType::Int64 {
                format!("{} = llabs({});", ops[0], ops[1])
            } else {
                format!("{} = abs((int){});", ops[0], ops[1])
            }
        }
        Sqrt => {
            if opencl && symbols.operand_type(instr, 0).is_complex() {
                format!("CSQRT({}, {});", ops[0], ops[1])
            } else {
                format!("{} = sqrt({});", ops[0], ops[1])
            }
        }
        Log => {
            if opencl && symbols.operand_type(instr, 0).is_complex() {
                format!("CLOG({}, {});", ops[0], ops[1])
            } else {
                format!("{} = log({});", ops[0], ops[1])
            }
        }
        NotEqual => {
            if opencl && symbols.operand_type(instr, 1).is_complex() {
                format!("CNEQ({}, {}, {});", ops[0], ops[1], ops[2])
            } else {
                format!("{} = {} != {};", ops[0], ops[1], ops[2])
            }
        }
        Equal => {
            if opencl && symbols.operand_type(instr, 1).is_complex() {
                format!("CEQ({}, {}, {});", ops[0], ops[1], ops[2])
            } else {
                format!("{} = {} == {};", ops[0], ops[1], ops[2])
            }
        }
        Power => {
            let t0 = symbols.operand_type(instr, 0);
            if opencl && t0.is_complex() {
                format!(
                    "CPOW({}, {}, {}, {});",
                    complex_scalar(t0),
                    ops[0],
                    ops[1],
                    ops[2]
                )
            } else if opencl && t0.is_integer() {
                format!("IPOW({}, {}, {});", ops[0], ops[1], ops[2])
            } else if t0.is_integer() {
                // pow() promotes to double for integer inputs anyway; the
                // cast keeps volatile-prone compilers honest.
                format!("{} = pow((double){}, (double){});", ops[0], ops[1], ops[2])
            } else {
                format!("{} = pow({}, {});", ops[0], ops[1], ops[2])
            }
        }
        Add | AddAccumulate => {
            if opencl && symbols.operand_type(instr, 0).is_complex() {
                format!("CADD({}, {}, {});", ops[0], ops[1], ops[2])
            } else {
                format!("{} = {} + {};", ops[0], ops[1], ops[2])
            }
        }
        AddReduce => {
            if opencl && symbols.operand_type(instr, 0).is_complex() {
                format!("CADD({}, {}, {});", ops[0], ops[0], ops[1])
            } else {
                format!("{} += {};", ops[0], ops[1])
            }
        }
        Subtract => {
            if opencl && symbols.operand_type(instr, 0).is_complex() {
                format!("CSUB({}, {}, {});", ops[0], ops[1], ops[2])
            } else {
                format!("{} = {} - {};", ops[0], ops[1], ops[2])
            }
        }
        Multiply | MultiplyAccumulate => {
            if opencl && symbols.operand_type(instr, 0).is_complex() {
                format!("CMUL({}, {}, {});", ops[0], ops[1], ops[2])
            } else {
                format!("{} = {} * {};", ops[0], ops[1], ops[2])
            }
        }
        MultiplyReduce => {
            if opencl && symbols.operand_type(instr, 0).is_complex() {
                format!("CMUL({}, {}, {});", ops[0], ops[0], ops[1])
            } else {
                format!("{} *= {};", ops[0], ops[1])
            }
        }
        Divide => {
            let t0 = symbols.operand_type(instr, 0);
            if opencl && t0.is_complex() {
                format!(
                    "CDIV({}, {}, {}, {});",
                    complex_scalar(t0),
                    ops[0],
                    ops[1],
                    ops[2]
                )
            } else if t0.is_signed_integer() {
                // NumPy floor division: round toward negative infinity
                // when the signs disagree and the remainder is non-zero.
                format!(
                    "{} = (({} > 0) != ({} > 0) && ({} % {}) != 0) ? \
                     ({} / {} - 1) : ({} / {});",
                    ops[0], ops[1], ops[2], ops[1], ops[2], ops[1], ops[2], ops[1], ops[2]
                )
            } else {
                format!("{} = {} / {};", ops[0], ops[1], ops[2])
            }
        }
        Identity => {
            let t0 = symbols.operand_type(instr, 0);
            let t1 = symbols.operand_type(instr, 1);
            let rhs = if opencl && t0 == ElemType::Complex64 && t1 == ElemType::Complex128 {
                format!("make_complex64((float){}.x, (float){}.y)", ops[1], ops[1])
            } else if opencl && t0 == ElemType::Complex128 && t1 == ElemType::Complex64 {
                format!("make_complex128((double){}.x, (double){}.y)", ops[1], ops[1])
            } else if opencl && t0.is_complex() && !t1.is_complex() {
                let bits = if t0 == ElemType::Complex64 { "64" } else { "128" };
                format!("make_complex{bits}({}, 0.0f)", ops[1])
            } else if opencl && t0 == ElemType::Bool && t1 != ElemType::Bool {
                format!("({} == 0 ? 0 : 1)", ops[1])
            } else {
                ops[1].clone()
            };
            format!("{} = {rhs};", ops[0])
        }
        Log10 => {
            // C99 has no complex log10; use log(z)/log(10).
            let t0 = symbols.operand_type(instr, 0);
            if opencl && t0.is_complex() {
                let bits = if t0 == ElemType::Complex64 { "64" } else { "128" };
                format!(
                    "CLOG({}, {}); CDIV({}, {}, {}, make_complex{bits}(log(10.0f), 0.0f));",
                    ops[0],
                    ops[1],
                    complex_scalar(t0),
                    ops[0],
                    ops[0]
                )
            } else if t0.is_complex() {
                format!("{} = clog({}) / log(10.0f);", ops[0], ops[1])
            } else {
                format!("{} = log10({});", ops[0], ops[1])
            }
        }
        Real => {
            if opencl {
                format!("{} = {}.x;", ops[0], ops[1])
            } else {
                format!("{} = creal({});", ops[0], ops[1])
            }
        }
        Imag => {
            if opencl {
                format!("{} = {}.y;", ops[0], ops[1])
            } else {
                format!("{} = cimag({});", ops[0], ops[1])
            }
        }
        Sign => {
            let t0 = symbols.operand_type(instr, 0);
            if t0.is_complex() {
                // csgn(z): 1 for Re(z) > 0, -1 for Re(z) < 0, else
                // sign(Im(z)); the imaginary part is always zero.
                let ct = complex_scalar(t0);
                if opencl {
                    format!(
                        "{{ {ct} re_ = {}.x; {ct} im_ = {}.y; {}.y = 0.0; \
                         {}.x = (re_ == 0 ? {} : {}); }}",
                        ops[1],
                        ops[1],
                        ops[0],
                        ops[0],
                        sign_expr("im_"),
                        sign_expr("re_")
                    )
                } else {
                    format!(
                        "{{ {ct} re_ = creal({}); {ct} im_ = cimag({}); \
                         {} = (re_ == 0 ? {} : {}); }}",
                        ops[1],
                        ops[1],
                        ops[0],
                        sign_expr("im_"),
                        sign_expr("re_")
                    )
                }
            } else {
                format!("{} = {};", ops[0], sign_expr(&ops[1]))
            }
        }
        Gather => format!("{} = {};", ops[0], ops[1]),
        Scatter => format!("{} = {};", ops[0], ops[1]),
        CondScatter => format!("if ({}) {{ {} = {}; }}", ops[2], ops[0], ops[1]),
        _ => return Err(Error::UnsupportedOpcode(instr.to_string())),
    };
    out.push_str(&line);
    out.push('\n');
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{OpenclBackend, OpenmpBackend, ParallelAnnotation};
    use crate::ir::{BaseArena, BaseId, Constant};
    use crate::passes::{build_block_tree, stamp_constructors};

    fn emit(arena: &BaseArena, mut instrs: Vec<Instruction>, backend: &dyn Backend) -> String {
        stamp_constructors(&mut instrs);
        let root = build_block_tree(instrs);
        let symbols = SymbolTable::build(&root, arena, usize::MAX);
        emit_kernel(&root, &symbols, backend).unwrap()
    }

    fn cpu() -> OpenmpBackend {
        OpenmpBackend::new(ParallelAnnotation::ParallelFor)
    }

    fn view(base: BaseId, shape: &[i64]) -> Operand {
        Operand::View(View::contiguous(base, shape))
    }

    #[test]
    fn elementwise_fuse_scalar_replaces_the_intermediate() {
        // c = a + b; d = c * 2.0 over float64[4]: one loop, two
        // statements, c lives in a register and is written back once.
        let mut arena = BaseArena::new();
        let a = arena.alloc(ElemType::Float64, 4);
        let b = arena.alloc(ElemType::Float64, 4);
        let c = arena.alloc(ElemType::Float64, 4);
        let d = arena.alloc(ElemType::Float64, 4);
        let add = Instruction::new(
            Opcode::Add,
            vec![view(c, &[4]), view(a, &[4]), view(b, &[4])],
        );
        let mul = Instruction::with_constant(
            Opcode::Multiply,
            vec![view(d, &[4]), view(c, &[4]), Operand::Const],
            Constant::Float64(2.0),
        );
        let src = emit(&arena, vec![add, mul], &cpu());
        assert_eq!(src.matches("for (").count(), 1);
        assert!(src.contains("#pragma omp parallel for\n"));
        assert!(src.contains("for (uint64_t i0 = 0; i0 < 4; ++i0) {"));
        assert!(src.contains("double s0; s0 = a0[idx0]; // duplicate access"));
        assert!(src.contains("s0 = a1[idx1] + a2[idx2];"));
        assert!(src.contains("a3[idx3] = s0 * c0;"));
        assert!(src.contains("a0[idx0] = s0;"));
        assert!(src.contains("const double c0"));
        assert!(src.contains(&format!("void {KERNEL_NAME}(void** args)")));
    }

    #[test]
    fn reduction_initialises_identity_and_stores_once() {
        let mut arena = BaseArena::new();
        let s = arena.alloc(ElemType::Int32, 1);
        let a = arena.alloc(ElemType::Int32, 8);
        let sum = Instruction::sweep(
            Opcode::AddReduce,
            View::flat(s, 1),
            View::flat(a, 8),
            0,
        );
        let src = emit(&arena, vec![sum], &cpu());
        assert!(src.contains("int32_t s0 = 0; // reduction accumulator"));
        assert!(src.contains("s0 += a1[idx1];"));
        assert!(src.contains("#pragma omp atomic\n"));
        assert!(src.contains("a0[vo0] = s0;"));
        // The identity assignment precedes the loop.
        assert!(src.find("s0 = 0").unwrap() < src.find("for (uint64_t i0").unwrap());
    }

    #[test]
    fn signed_integer_divide_uses_floor_semantics() {
        let mut arena = BaseArena::new();
        let q = arena.alloc(ElemType::Int32, 1);
        let a = arena.alloc(ElemType::Int32, 1);
        let div = Instruction::with_constant(
            Opcode::Divide,
            vec![view(q, &[1]), view(a, &[1]), Operand::Const],
            Constant::Int32(2),
        );
        let src = emit(&arena, vec![div], &cpu());
        assert!(src.contains(
            "a0[idx0] = ((a1[idx1] > 0) != (c0 > 0) && (a1[idx1] % c0) != 0) ? \
             (a1[idx1] / c0 - 1) : (a1[idx1] / c0);"
        ));
    }

    #[test]
    fn unsigned_divide_stays_plain() {
        let mut arena = BaseArena::new();
        let q = arena.alloc(ElemType::UInt32, 1);
        let a = arena.alloc(ElemType::UInt32, 1);
        let div = Instruction::with_constant(
            Opcode::Divide,
            vec![view(q, &[1]), view(a, &[1]), Operand::Const],
            Constant::UInt32(2),
        );
        let src = emit(&arena, vec![div], &cpu());
        assert!(src.contains("a0[idx0] = a1[idx1] / c0;"));
    }

    #[test]
    fn complex_log10_on_the_device_dialect() {
        let mut arena = BaseArena::new();
        let y = arena.alloc(ElemType::Complex64, 4);
        let x = arena.alloc(ElemType::Complex64, 4);
        let log10 = Instruction::new(
            Opcode::Log10,
            vec![view(y, &[4]), view(x, &[4])],
        );
        let src = emit(&arena, vec![log10], &OpenclBackend);
        assert!(src.contains(&format!("__kernel void {KERNEL_NAME}(")));
        assert!(src.contains("__global float2*"));
        assert!(src.contains("get_global_id(0)"));
        assert!(src.contains("CLOG(a0[idx0], a1[idx1]);"));
        assert!(src.contains("CDIV(float, a0[idx0], a0[idx0], \
                              make_complex64(log(10.0f), 0.0f));"));
    }

    #[test]
    fn accumulation_reads_the_previous_element() {
        let mut arena = BaseArena::new();
        let out = arena.alloc(ElemType::Int32, 8);
        let a = arena.alloc(ElemType::Int32, 8);
        let acc = Instruction::sweep(
            Opcode::AddAccumulate,
            View::flat(out, 8),
            View::flat(a, 8),
            0,
        );
        let src = emit(&arena, vec![acc], &cpu());
        // The sweep axis is sequential: no parallel annotation.
        assert!(!src.contains("#pragma omp parallel for"));
        assert!(src.contains("a0[idx0] = ((i0 == 0) ? 0 : a0[idx0 - vs0_0]) + a1[idx1];"));
    }

    #[test]
    fn argument_order_is_pointers_offsets_strides_constants() {
        let mut arena = BaseArena::new();
        let d = arena.alloc(ElemType::Float64, 4);
        let a = arena.alloc(ElemType::Float64, 4);
        let mul = Instruction::with_constant(
            Opcode::Multiply,
            vec![view(d, &[4]), view(a, &[4]), Operand::Const],
            Constant::Float64(0.5),
        );
        let src = emit(&arena, vec![mul], &cpu());
        let sig_at = src.find("static void kernel_body(").unwrap();
        let sig = &src[sig_at..src[sig_at..].find(')').unwrap() + sig_at];
        let pos = |needle: &str| sig.find(needle).unwrap();
        assert!(pos("double* __restrict__ a0") < pos("a1"));
        assert!(pos("a1") < pos("uint64_t vo0"));
        assert!(pos("uint64_t vo0") < pos("uint64_t vs0_0"));
        assert!(pos("vs1_0") < pos("const double c0"));
    }

    #[test]
    fn extension_methods_are_not_emittable() {
        let mut arena = BaseArena::new();
        let a = arena.alloc(ElemType::Float64, 4);
        let mut instrs =
            vec![Instruction::new(Opcode::Extension(7), vec![view(a, &[4])])];
        stamp_constructors(&mut instrs);
        let root = build_block_tree(instrs);
        let symbols = SymbolTable::build(&root, &arena, usize::MAX);
        let err = emit_kernel(&root, &symbols, &cpu()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedOpcode(_)));
    }

    #[test]
    fn bool_invert_is_logical_negation() {
        let mut arena = BaseArena::new();
        let o = arena.alloc(ElemType::Bool, 4);
        let a = arena.alloc(ElemType::Bool, 4);
        let invert =
            Instruction::new(Opcode::Invert, vec![view(o, &[4]), view(a, &[4])]);
        let src = emit(&arena, vec![invert], &cpu());
        assert!(src.contains("a0[idx0] = !a1[idx1];"));

        let mut arena = BaseArena::new();
        let o = arena.alloc(ElemType::UInt8, 4);
        let a = arena.alloc(ElemType::UInt8, 4);
        let invert =
            Instruction::new(Opcode::Invert, vec![view(o, &[4]), view(a, &[4])]);
        let src = emit(&arena, vec![invert], &cpu());
        assert!(src.contains("a0[idx0] = ~a1[idx1];"));
    }

    #[test]
    fn random_opcode_uses_the_preamble_helper() {
        let mut arena = BaseArena::new();
        let o = arena.alloc(ElemType::UInt64, 8);
        let rng = Instruction::with_constant(
            Opcode::Random,
            vec![view(o, &[8]), Operand::Const],
            Constant::R123 { start: 7, key: 9 },
        );
        let src = emit(&arena, vec![rng], &cpu());
        assert!(src.contains("static inline uint64_t util_random123"));
        assert!(src.contains("a0[idx0] = util_random123(7ULL + (i0), 9ULL);"));
    }

    #[test]
    fn system_only_trees_emit_a_comment_instead_of_loops() {
        let mut arena = BaseArena::new();
        let a = arena.alloc(ElemType::Float64, 4);
        let mut instrs = vec![Instruction::new(
            Opcode::Free,
            vec![Operand::View(View::flat(a, 4))],
        )];
        stamp_constructors(&mut instrs);
        let root = build_block_tree(instrs);
        let symbols = SymbolTable::build(&root, &arena, usize::MAX);
        let src = emit_kernel(&root, &symbols, &cpu()).unwrap();
        assert!(src.contains("// Removed loop with only system instructions"));
        assert!(!src.contains("for ("));
    }
}
