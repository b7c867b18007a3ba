use crate::backend::{Backend, BackendKind, ParallelAnnotation};
use crate::common::ElemType;
use crate::ir::Constant;
use crate::passes::LoopBlock;

/// CPU dialect: C99 with OpenMP work-sharing pragmas, C library complex
/// arithmetic, and a uniform `void (void**)` entry point unpacking into
/// the typed kernel.
pub struct OpenmpBackend {
    pub annotation: ParallelAnnotation,
}

impl OpenmpBackend {
    pub fn new(annotation: ParallelAnnotation) -> Self {
        OpenmpBackend { annotation }
    }
}

impl Backend for OpenmpBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Openmp
    }

    fn flags(&self) -> String {
        let annot = match self.annotation {
            ParallelAnnotation::Sequential => "sequential",
            ParallelAnnotation::ParallelFor => "parallel-for",
            ParallelAnnotation::ParallelForSimd => "parallel-for-simd",
        };
        format!("annotation={annot}")
    }

    fn write_type(&self, dtype: ElemType) -> &'static str {
        match dtype {
            ElemType::Bool => "bool",
            ElemType::Int8 => "int8_t",
            ElemType::Int16 => "int16_t",
            ElemType::Int32 => "int32_t",
            ElemType::Int64 => "int64_t",
            ElemType::UInt8 => "uint8_t",
            ElemType::UInt16 => "uint16_t",
            ElemType::UInt32 => "uint32_t",
            ElemType::UInt64 | ElemType::R123 => "uint64_t",
            ElemType::Float32 => "float",
            ElemType::Float64 => "double",
            ElemType::Complex64 => "float complex",
            ElemType::Complex128 => "double complex",
        }
    }

    fn restrict_kw(&self) -> &'static str {
        "__restrict__"
    }

    fn array_qualifier(&self) -> &'static str {
        ""
    }

    fn preamble(&self, uses_random: bool, out: &mut String) {
        out.push_str("#include <stdint.h>\n");
        out.push_str("#include <stdbool.h>\n");
        out.push_str("#include <math.h>\n");
        out.push_str("#include <complex.h>\n");
        out.push_str("#include <stdlib.h>\n");
        if uses_random {
            out.push_str(
                "\nstatic inline uint64_t util_random123(uint64_t counter, uint64_t key) {\n\
                 \x20   uint64_t x0 = counter, x1 = 0;\n\
                 \x20   for (int r = 0; r < 10; ++r) {\n\
                 \x20       __uint128_t p = (__uint128_t)x0 * 0xD2B74407B1CE6E93ULL;\n\
                 \x20       x0 = (uint64_t)(p >> 64) ^ key ^ x1;\n\
                 \x20       x1 = (uint64_t)p;\n\
                 \x20       key += 0x9E3779B97F4A7C15ULL;\n\
                 \x20   }\n\
                 \x20   return x0;\n\
                 }\n",
            );
        }
        out.push('\n');
    }

    fn write_constant(&self, c: &Constant) -> String {
        match *c {
            Constant::Bool(v) => if v { "true" } else { "false" }.to_string(),
            Constant::Int8(v) => format!("{v}"),
            Constant::Int16(v) => format!("{v}"),
            Constant::Int32(v) if v == i32::MIN => "INT32_MIN".to_string(),
            Constant::Int32(v) => format!("{v}"),
            Constant::Int64(v) if v == i64::MIN => "INT64_MIN".to_string(),
            Constant::Int64(v) => format!("{v}LL"),
            Constant::UInt8(v) => format!("{v}"),
            Constant::UInt16(v) => format!("{v}"),
            Constant::UInt32(v) => format!("{v}U"),
            Constant::UInt64(v) => format!("{v}ULL"),
            Constant::Float32(v) => float32_literal(v),
            Constant::Float64(v) => float64_literal(v),
            Constant::Complex64 { re, im } => {
                format!("({} + {}*I)", float32_literal(re), float32_literal(im))
            }
            Constant::Complex128 { re, im } => {
                format!("({} + {}*I)", float64_literal(re), float64_literal(im))
            }
            Constant::R123 { start, .. } => format!("{start}ULL"),
        }
    }

    fn loop_head(&self, lp: &LoopBlock, parallel: bool, indent: &str, out: &mut String) -> usize {
        if parallel {
            match self.annotation {
                ParallelAnnotation::Sequential => {}
                ParallelAnnotation::ParallelFor => {
                    out.push_str(indent);
                    out.push_str("#pragma omp parallel for\n");
                }
                ParallelAnnotation::ParallelForSimd => {
                    out.push_str(indent);
                    out.push_str("#pragma omp parallel for simd\n");
                }
            }
        }
        let r = lp.rank;
        out.push_str(indent);
        out.push_str(&format!("for (uint64_t i{r} = 0; i{r} < {}; ++i{r}) {{\n", lp.size));
        1
    }

    fn wants_parallel(&self) -> bool {
        self.annotation != ParallelAnnotation::Sequential
    }
}

fn float32_literal(v: f32) -> String {
    if v.is_nan() {
        "NAN".to_string()
    } else if v == f32::INFINITY {
        "INFINITY".to_string()
    } else if v == f32::NEG_INFINITY {
        "-INFINITY".to_string()
    } else {
        format!("{v:?}f")
    }
}

fn float64_literal(v: f64) -> String {
    if v.is_nan() {
        "NAN".to_string()
    } else if v == f64::INFINITY {
        "INFINITY".to_string()
    } else if v == f64::NEG_INFINITY {
        "-INFINITY".to_string()
    } else {
        format!("{v:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_literals() {
        let b = OpenmpBackend::new(ParallelAnnotation::ParallelFor);
        assert_eq!(b.write_constant(&Constant::Float64(2.0)), "2.0");
        assert_eq!(b.write_constant(&Constant::Float32(1.5)), "1.5f");
        assert_eq!(b.write_constant(&Constant::Int32(i32::MIN)), "INT32_MIN");
        assert_eq!(b.write_constant(&Constant::Float64(f64::NEG_INFINITY)), "-INFINITY");
        assert_eq!(
            b.write_constant(&Constant::Complex64 { re: 1.0, im: -2.0 }),
            "(1.0f + -2.0f*I)"
        );
        assert_eq!(b.write_constant(&Constant::UInt64(7)), "7ULL");
    }

    #[test]
    fn loop_head_annotation() {
        let b = OpenmpBackend::new(ParallelAnnotation::ParallelFor);
        let lp = LoopBlock { rank: 0, size: 4, ..LoopBlock::kernel_root() };
        let mut out = String::new();
        let braces = b.loop_head(&lp, true, "    ", &mut out);
        assert_eq!(braces, 1);
        assert!(out.contains("#pragma omp parallel for\n"));
        assert!(out.contains("for (uint64_t i0 = 0; i0 < 4; ++i0) {"));
        let mut seq = String::new();
        b.loop_head(&lp, false, "    ", &mut seq);
        assert!(!seq.contains("#pragma"));
    }
}
