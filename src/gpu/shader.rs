//! Kernel descriptors, shader preprocessing and uniform introspection.
//!
//! A [`KernelDescriptor`] pairs a fragment template with the typed list of
//! parameters the kernel is invoked with. Compiling a descriptor runs the
//! preprocessor (comment stripping, `@include "file.glsl"`, `@CONSTANT@`
//! substitution, `#define` injection), then parses every `uniform`
//! declaration of the generated source and checks that it matches the
//! parameter list exactly. A mismatch is a compile-time error.

use crate::constants::shader_constant;
use crate::gpu::backend::UniformType;
use crate::gpu::error::{GpuError, GpuResult};
use crate::gpu::library;
use std::collections::{BTreeMap, HashSet};

/// Name of the implicit output-size uniform every fragment shader declares.
pub const TEX_SIZE_UNIFORM: &str = "texSize";

/// Header prepended to every fragment template.
pub const FRAGMENT_PREFIX: &str = "#version 300 es
precision highp float;
precision highp int;
precision mediump sampler2D;
out vec4 color;
uniform highp vec2 texSize;
@include \"global.glsl\"
";

/// Vertex stage shared by all kernels: a full-screen triangle strip.
pub const VERTEX_SHADER: &str = "#version 300 es
precision highp float;
layout (location=0) in vec2 a_position;
layout (location=1) in vec2 a_texCoord;
out highp vec2 texCoord;
void main() {
    gl_Position = vec4(a_position, 0.0, 1.0);
    texCoord = a_texCoord;
}
";

/// One formal parameter of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelParam {
    pub name: &'static str,
    pub ty: UniformType,
    /// Declared array length, if the uniform is an array
    pub len: Option<usize>,
}

impl KernelParam {
    pub const fn new(name: &'static str, ty: UniformType) -> Self {
        Self { name, ty, len: None }
    }

    pub const fn array(name: &'static str, ty: UniformType, len: usize) -> Self {
        Self {
            name,
            ty,
            len: Some(len),
        }
    }
}

/// Everything needed to compile a kernel.
#[derive(Debug, Clone, Copy)]
pub struct KernelDescriptor {
    pub name: &'static str,
    /// Fragment template (without [`FRAGMENT_PREFIX`])
    pub source: &'static str,
    pub params: &'static [KernelParam],
    pub defines: &'static [(&'static str, &'static str)],
}

impl KernelDescriptor {
    /// Generate the complete fragment source.
    pub fn fragment_source(&self) -> GpuResult<String> {
        let template = format!("{}{}", FRAGMENT_PREFIX, self.source);
        preprocess(&template, self.defines)
    }

    /// Check the generated source against the parameter list and return the
    /// expanded uniform table (parameters first, then `texSize`).
    pub fn uniform_table(&self, fragment: &str) -> GpuResult<Vec<(String, UniformType)>> {
        let declared = parse_uniforms(fragment)?;
        validate_params(self.name, self.params, &declared)
    }
}

/// A parsed `uniform` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformDecl {
    pub name: String,
    pub ty: UniformType,
    pub array_len: Option<usize>,
}

/// Run the preprocessor over a template.
pub fn preprocess(source: &str, defines: &[(&str, &str)]) -> GpuResult<String> {
    let mut stack = Vec::new();
    let expanded = resolve_includes(&strip_comments(source), &mut stack)?;
    let substituted = substitute_constants(&expanded)?;
    Ok(inject_defines(&substituted, defines))
}

fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '/' {
            match chars.peek() {
                Some('/') => {
                    for c in chars.by_ref() {
                        if c == '\n' {
                            out.push('\n');
                            break;
                        }
                    }
                    continue;
                }
                Some('*') => {
                    chars.next();
                    let mut prev = '\0';
                    for c in chars.by_ref() {
                        if c == '\n' {
                            out.push('\n');
                        }
                        if prev == '*' && c == '/' {
                            break;
                        }
                        prev = c;
                    }
                    continue;
                }
                _ => {}
            }
        }
        out.push(c);
    }

    out
}

fn is_valid_include_name(name: &str) -> bool {
    match name.strip_suffix(".glsl") {
        Some(stem) => {
            !stem.is_empty()
                && stem
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }
        None => false,
    }
}

fn resolve_includes(source: &str, stack: &mut Vec<String>) -> GpuResult<String> {
    let mut out = String::with_capacity(source.len());

    for line in source.lines() {
        let trimmed = line.trim();
        let Some(rest) = trimmed.strip_prefix("@include") else {
            out.push_str(line);
            out.push('\n');
            continue;
        };

        let filename = rest
            .trim()
            .strip_prefix('"')
            .and_then(|r| r.strip_suffix('"'))
            .ok_or_else(|| GpuError::Preprocessor(format!("malformed include: {}", trimmed)))?;

        if !is_valid_include_name(filename) {
            return Err(GpuError::Preprocessor(format!(
                "invalid include file name: {}",
                filename
            )));
        }
        if stack.iter().any(|f| f == filename) {
            return Err(GpuError::Preprocessor(format!(
                "include cycle: {} -> {}",
                stack.join(" -> "),
                filename
            )));
        }

        let contents = library::include_file(filename)
            .ok_or_else(|| GpuError::Preprocessor(format!("shader file not found: {}", filename)))?;

        stack.push(filename.to_string());
        let expanded = resolve_includes(&strip_comments(contents), stack)?;
        stack.pop();
        out.push_str(&expanded);
    }

    Ok(out)
}

fn substitute_constants(source: &str) -> GpuResult<String> {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;

    while let Some(start) = rest.find('@') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after
            .find('@')
            .ok_or_else(|| GpuError::Preprocessor(format!("stray '@' near: {}", after.lines().next().unwrap_or(""))))?;
        let name = &after[..end];

        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(GpuError::Preprocessor(format!("invalid constant name @{}@", name)));
        }

        let value = shader_constant(name)
            .ok_or_else(|| GpuError::Preprocessor(format!("undefined constant @{}@", name)))?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

fn inject_defines(source: &str, defines: &[(&str, &str)]) -> String {
    if defines.is_empty() {
        return source.to_string();
    }

    let block: String = defines
        .iter()
        .map(|(name, value)| format!("#define {} {}\n", name, value))
        .collect();

    match source.split_once('\n') {
        Some((first, rest)) if first.trim_start().starts_with("#version") => {
            format!("{}\n{}{}", first, block, rest)
        }
        _ => format!("{}{}", block, source),
    }
}

/// Find every `uniform` declaration in a (preprocessed) source.
pub fn parse_uniforms(source: &str) -> GpuResult<Vec<UniformDecl>> {
    let code: String = source
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n");

    let mut declarations = Vec::new();
    for statement in code.split(';') {
        let statement = statement
            .rsplit(['{', '}'])
            .next()
            .unwrap_or(statement)
            .trim();
        let Some(rest) = statement.strip_prefix("uniform") else {
            continue;
        };
        if !rest.starts_with(char::is_whitespace) {
            continue;
        }

        let mut tokens = rest.split_whitespace().peekable();
        if matches!(tokens.peek(), Some(&("lowp" | "mediump" | "highp"))) {
            tokens.next();
        }
        let type_name = tokens
            .next()
            .ok_or_else(|| GpuError::Preprocessor(format!("incomplete declaration: {}", statement)))?;
        let ty = UniformType::from_glsl(type_name).ok_or_else(|| {
            GpuError::Preprocessor(format!("unsupported uniform type {} in: {}", type_name, statement))
        })?;

        let names: String = tokens.collect::<Vec<_>>().join("");
        for name in names.split(',').filter(|n| !n.is_empty()) {
            declarations.push(parse_declarator(name, ty)?);
        }
    }

    Ok(declarations)
}

fn parse_declarator(declarator: &str, ty: UniformType) -> GpuResult<UniformDecl> {
    let Some((name, rest)) = declarator.split_once('[') else {
        return Ok(UniformDecl {
            name: declarator.to_string(),
            ty,
            array_len: None,
        });
    };

    let len = rest
        .strip_suffix(']')
        .filter(|n| !n.is_empty())
        .ok_or_else(|| {
            GpuError::Preprocessor(format!("unspecified array length in uniform {}", declarator))
        })?
        .parse::<usize>()
        .map_err(|_| GpuError::Preprocessor(format!("invalid array length in uniform {}", declarator)))?;

    Ok(UniformDecl {
        name: name.to_string(),
        ty,
        array_len: Some(len),
    })
}

/// Expand array declarations into `name[i]` entries.
pub fn expand_uniforms(declarations: &[UniformDecl]) -> Vec<(String, UniformType)> {
    let mut uniforms = Vec::new();
    for decl in declarations {
        match decl.array_len {
            None => uniforms.push((decl.name.clone(), decl.ty)),
            Some(len) => {
                for i in 0..len {
                    uniforms.push((format!("{}[{}]", decl.name, i), decl.ty));
                }
            }
        }
    }
    uniforms
}

fn expand_params(params: &[KernelParam]) -> Vec<(String, UniformType)> {
    let mut expanded = Vec::new();
    for param in params {
        match param.len {
            None => expanded.push((param.name.to_string(), param.ty)),
            Some(len) => {
                for i in 0..len {
                    expanded.push((format!("{}[{}]", param.name, i), param.ty));
                }
            }
        }
    }
    expanded
}

fn validate_params(
    kernel: &str,
    params: &[KernelParam],
    declared: &[UniformDecl],
) -> GpuResult<Vec<(String, UniformType)>> {
    let mismatch = |message: String| GpuError::UniformMismatch {
        kernel: kernel.to_string(),
        message,
    };

    let mut seen = HashSet::new();
    for param in params {
        if !seen.insert(param.name) {
            return Err(mismatch(format!("parameter {} is listed twice", param.name)));
        }
        if param.name == TEX_SIZE_UNIFORM {
            return Err(mismatch(format!("{} is reserved", TEX_SIZE_UNIFORM)));
        }
    }

    let discovered: BTreeMap<String, UniformType> = expand_uniforms(declared)
        .into_iter()
        .filter(|(name, _)| name != TEX_SIZE_UNIFORM)
        .collect();
    let expected = expand_params(params);

    for (name, ty) in &expected {
        match discovered.get(name) {
            None => {
                return Err(mismatch(format!(
                    "parameter {} has not been declared as a uniform",
                    name
                )))
            }
            Some(found) if found != ty => {
                return Err(mismatch(format!(
                    "parameter {} is {} but the shader declares {}",
                    name, ty, found
                )))
            }
            Some(_) => {}
        }
    }

    let expected_names: HashSet<&str> = expected.iter().map(|(n, _)| n.as_str()).collect();
    if let Some(extra) = discovered.keys().find(|n| !expected_names.contains(n.as_str())) {
        return Err(mismatch(format!(
            "uniform {} is not a parameter of the kernel",
            extra
        )));
    }

    let mut table = expected;
    table.push((TEX_SIZE_UNIFORM.to_string(), UniformType::Vec2));
    Ok(table)
}

/// Line-numbered source followed by the compiler log.
pub fn compile_diagnostics(source: &str, log: &str) -> String {
    let mut out = String::new();
    for (i, line) in source.lines().enumerate() {
        out.push_str(&format!("{:>4} | {}\n", i + 1, line));
    }
    out.push('\n');
    out.push_str(log);
    out
}
