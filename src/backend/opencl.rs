use crate::backend::{Backend, BackendKind};
use crate::common::ElemType;
use crate::ir::Constant;
use crate::passes::LoopBlock;

/// Device dialect: OpenCL C with vector-typed complex numbers and the
/// macro forms the emitter expands complex arithmetic into. The outermost
/// loop becomes the work-item index.
pub struct OpenclBackend;

/// Complex macros and helpers prepended to every device kernel. `.x` is
/// the real part, `.y` the imaginary part.
const COMPLEX_MACROS: &str = "\
#define make_complex64(r, i) ((float2)((r), (i)))
#define make_complex128(r, i) ((double2)((r), (i)))
#define CADD(o, a, b) (o) = (a) + (b);
#define CSUB(o, a, b) (o) = (a) - (b);
#define CMUL(o, a, b) { double rx_ = (a).x*(b).x - (a).y*(b).y; double ry_ = (a).x*(b).y + (a).y*(b).x; \\
    (o).x = rx_; (o).y = ry_; }
#define CDIV(t, o, a, b) { t d_ = (b).x*(b).x + (b).y*(b).y; \\
    t rx_ = ((a).x*(b).x + (a).y*(b).y)/d_; t ry_ = ((a).y*(b).x - (a).x*(b).y)/d_; \\
    (o).x = rx_; (o).y = ry_; }
#define CABS(o, a) (o) = sqrt((a).x*(a).x + (a).y*(a).y);
#define CSQRT(o, a) { double r_ = sqrt(hypot((a).x, (a).y)); double t_ = atan2((a).y, (a).x)/2; \\
    (o).x = r_*cos(t_); (o).y = r_*sin(t_); }
#define CLOG(o, a) { double rx_ = log(hypot((a).x, (a).y)); double ry_ = atan2((a).y, (a).x); \\
    (o).x = rx_; (o).y = ry_; }
#define CEXP(t, o, a) { t e_ = exp((a).x); t ry_ = e_*sin((a).y); (o).x = e_*cos((a).y); (o).y = ry_; }
#define CSIN(t, o, a) { t rx_ = sin((a).x)*cosh((a).y); t ry_ = cos((a).x)*sinh((a).y); \\
    (o).x = rx_; (o).y = ry_; }
#define CCOS(t, o, a) { t rx_ = cos((a).x)*cosh((a).y); t ry_ = -sin((a).x)*sinh((a).y); \\
    (o).x = rx_; (o).y = ry_; }
#define CTAN(t, o, a) { t d_ = cos(2*(a).x) + cosh(2*(a).y); \\
    t rx_ = sin(2*(a).x)/d_; t ry_ = sinh(2*(a).y)/d_; (o).x = rx_; (o).y = ry_; }
#define CSINH(t, o, a) { t rx_ = sinh((a).x)*cos((a).y); t ry_ = cosh((a).x)*sin((a).y); \\
    (o).x = rx_; (o).y = ry_; }
#define CCOSH(t, o, a) { t rx_ = cosh((a).x)*cos((a).y); t ry_ = sinh((a).x)*sin((a).y); \\
    (o).x = rx_; (o).y = ry_; }
#define CTANH(t, o, a) { t d_ = cosh(2*(a).x) + cos(2*(a).y); \\
    t rx_ = sinh(2*(a).x)/d_; t ry_ = sin(2*(a).y)/d_; (o).x = rx_; (o).y = ry_; }
#define CPOW(t, o, a, b) { t lr_ = log(hypot((a).x, (a).y)); t th_ = atan2((a).y, (a).x); \\
    t rx_ = (b).x*lr_ - (b).y*th_; t ry_ = (b).y*lr_ + (b).x*th_; t e_ = exp(rx_); \\
    (o).x = e_*cos(ry_); (o).y = e_*sin(ry_); }
#define CEQ(o, a, b) (o) = ((a).x == (b).x) && ((a).y == (b).y);
#define CNEQ(o, a, b) (o) = ((a).x != (b).x) || ((a).y != (b).y);
#define IPOW(o, a, b) { (o) = 1; ulong e_ = (ulong)(b); ulong x_ = (ulong)(a); \\
    while (e_) { if (e_ & 1) (o) *= x_; x_ *= x_; e_ >>= 1; } }
";

impl Backend for OpenclBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Opencl
    }

    fn flags(&self) -> String {
        "work-item=axis0".to_string()
    }

    fn write_type(&self, dtype: ElemType) -> &'static str {
        match dtype {
            ElemType::Bool => "uchar",
            ElemType::Int8 => "char",
            ElemType::Int16 => "short",
            ElemType::Int32 => "int",
            ElemType::Int64 => "long",
            ElemType::UInt8 => "uchar",
            ElemType::UInt16 => "ushort",
            ElemType::UInt32 => "uint",
            ElemType::UInt64 | ElemType::R123 => "ulong",
            ElemType::Float32 => "float",
            ElemType::Float64 => "double",
            ElemType::Complex64 => "float2",
            ElemType::Complex128 => "double2",
        }
    }

    fn restrict_kw(&self) -> &'static str {
        "restrict"
    }

    fn array_qualifier(&self) -> &'static str {
        "__global "
    }

    fn preamble(&self, uses_random: bool, out: &mut String) {
        out.push_str("#pragma OPENCL EXTENSION cl_khr_fp64 : enable\n");
        out.push_str(COMPLEX_MACROS);
        if uses_random {
            out.push_str(
                "\nulong util_random123(ulong counter, ulong key) {\n\
                 \x20   ulong x0 = counter, x1 = 0;\n\
                 \x20   for (int r = 0; r < 10; ++r) {\n\
                 \x20       ulong hi = mul_hi(x0, 0xD2B74407B1CE6E93UL);\n\
                 \x20       ulong lo = x0 * 0xD2B74407B1CE6E93UL;\n\
                 \x20       x0 = hi ^ key ^ x1;\n\
                 \x20       x1 = lo;\n\
                 \x20       key += 0x9E3779B97F4A7C15UL;\n\
                 \x20   }\n\
                 \x20   return x0;\n\
                 }\n",
            );
        }
        out.push('\n');
    }

    fn write_constant(&self, c: &Constant) -> String {
        match *c {
            Constant::Bool(v) => format!("{}", v as u8),
            Constant::Int8(v) => format!("{v}"),
            Constant::Int16(v) => format!("{v}"),
            Constant::Int32(v) if v == i32::MIN => "(-2147483647 - 1)".to_string(),
            Constant::Int32(v) => format!("{v}"),
            Constant::Int64(v) if v == i64::MIN => "(-9223372036854775807L - 1)".to_string(),
            Constant::Int64(v) => format!("{v}L"),
            Constant::UInt8(v) => format!("{v}"),
            Constant::UInt16(v) => format!("{v}"),
            Constant::UInt32(v) => format!("{v}U"),
            Constant::UInt64(v) => format!("{v}UL"),
            Constant::Float32(v) => float_literal(v as f64, "f"),
            Constant::Float64(v) => float_literal(v, ""),
            Constant::Complex64 { re, im } => format!(
                "make_complex64({}, {})",
                float_literal(re as f64, "f"),
                float_literal(im as f64, "f")
            ),
            Constant::Complex128 { re, im } => {
                format!("make_complex128({}, {})", float_literal(re, ""), float_literal(im, ""))
            }
            Constant::R123 { start, .. } => format!("{start}UL"),
        }
    }

    fn loop_head(&self, lp: &LoopBlock, parallel: bool, indent: &str, out: &mut String) -> usize {
        let r = lp.rank;
        if parallel && r == 0 {
            out.push_str(indent);
            out.push_str("{ // work-item over axis 0\n");
            out.push_str(indent);
            out.push_str("const ulong i0 = get_global_id(0);\n");
            out.push_str(indent);
            out.push_str(&format!("if (i0 < {}) {{\n", lp.size));
            2
        } else {
            out.push_str(indent);
            out.push_str(&format!("for (ulong i{r} = 0; i{r} < {}; ++i{r}) {{\n", lp.size));
            1
        }
    }

    fn wants_parallel(&self) -> bool {
        true
    }
}

fn float_literal(v: f64, suffix: &str) -> String {
    if v.is_nan() {
        "NAN".to_string()
    } else if v == f64::INFINITY {
        "INFINITY".to_string()
    } else if v == f64::NEG_INFINITY {
        "-INFINITY".to_string()
    } else {
        format!("{v:?}{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_types_and_constants() {
        let b = OpenclBackend;
        assert_eq!(b.write_type(ElemType::Complex64), "float2");
        assert_eq!(b.write_type(ElemType::Bool), "uchar");
        assert_eq!(b.write_type(ElemType::UInt64), "ulong");
        assert_eq!(
            b.write_constant(&Constant::Complex64 { re: 0.0, im: 1.0 }),
            "make_complex64(0.0f, 1.0f)"
        );
        assert_eq!(b.write_constant(&Constant::Int64(5)), "5L");
    }

    #[test]
    fn work_item_loop_head_opens_two_braces() {
        let b = OpenclBackend;
        let lp = LoopBlock { rank: 0, size: 16, ..LoopBlock::kernel_root() };
        let mut out = String::new();
        assert_eq!(b.loop_head(&lp, true, "", &mut out), 2);
        assert!(out.contains("get_global_id(0)"));
        assert!(out.contains("if (i0 < 16) {"));
        let mut seq = String::new();
        assert_eq!(b.loop_head(&lp, false, "", &mut seq), 1);
        assert!(seq.contains("for (ulong i0"));
    }
}
