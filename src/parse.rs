//! Parser for the spec request grammar.
//!
//! ```text
//! spec     := name? version? (variant | compiler | target)* ("^" spec)*
//! version  := "@" constraint
//! variant  := ("+" | "~") name | name "=" value
//! compiler := "%" (langs "=")? name version?
//! target   := "target=" name
//! ```
//!
//! Several root specs may be given at once (`hdf5+mpi zlib@1.3`); a bare
//! name after a named spec starts a new root. A `^` constraint always hangs
//! off the root it follows, and everything after it (until the next `^` or
//! new root) constrains that dependency.

use std::ops::Range;

use logos::Logos;

use crate::spec::{DependencyConstraint, DependencyKind, Spec, VariantValue};
use crate::version::VersionConstraint;

#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n]+")]
enum Token {
    #[token("^")]
    Caret,
    #[token("%")]
    Percent,
    #[regex(r"@=?[A-Za-z0-9_.:,\-]*")]
    Version,
    #[regex(r"[+~][A-Za-z0-9_][A-Za-z0-9_.\-]*")]
    BoolVariant,
    #[regex(r"[A-Za-z0-9_][A-Za-z0-9_.,\-]*=[A-Za-z0-9_.,:\-/*]*")]
    KeyValue,
    #[regex(r"[A-Za-z0-9_][A-Za-z0-9_.\-]*")]
    Name,
}

/// Error produced while parsing a spec string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} at column {}", .span.start + 1)]
pub struct ParseError {
    /// The full input that failed to parse.
    pub input: String,
    /// Byte range of the offending token.
    pub span: Range<usize>,
    /// What went wrong.
    pub message: String,
}

impl ParseError {
    fn new(input: &str, span: Range<usize>, message: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            span,
            message: message.into(),
        }
    }

    /// Render the input with a caret line under the offending token.
    pub fn render(&self) -> String {
        let width = self.span.len().max(1);
        format!(
            "{}\n  {}\n  {}{}",
            self.message,
            self.input,
            " ".repeat(self.span.start),
            "^".repeat(width)
        )
    }
}

struct Lexeme<'a> {
    token: Token,
    span: Range<usize>,
    text: &'a str,
}

fn tokenize(input: &str) -> Result<Vec<Lexeme<'_>>, ParseError> {
    let mut lexer = Token::lexer(input);
    let mut out = Vec::new();
    while let Some(token) = lexer.next() {
        let span = lexer.span();
        match token {
            Ok(token) => out.push(Lexeme {
                token,
                span,
                text: lexer.slice(),
            }),
            Err(()) => return Err(ParseError::new(input, span, "unexpected character")),
        }
    }
    Ok(out)
}

/// Which spec subsequent constraints attach to.
#[derive(Clone, Copy)]
enum Cursor {
    Root,
    Nested(usize),
}

struct SpecParser<'a> {
    input: &'a str,
    roots: Vec<Spec>,
    cursor: Cursor,
}

impl<'a> SpecParser<'a> {
    fn current(&mut self) -> Option<&mut Spec> {
        let root = self.roots.last_mut()?;
        match self.cursor {
            Cursor::Root => Some(root),
            Cursor::Nested(idx) => root.dependencies.get_mut(idx).map(|d| &mut d.spec),
        }
    }

    fn current_or_new(&mut self) -> &mut Spec {
        if self.roots.is_empty() {
            self.roots.push(Spec::default());
            self.cursor = Cursor::Root;
        }
        let idx = self.roots.len() - 1;
        match self.cursor {
            Cursor::Nested(dep) if dep < self.roots[idx].dependencies.len() => {
                &mut self.roots[idx].dependencies[dep].spec
            }
            _ => &mut self.roots[idx],
        }
    }

    fn error(&self, span: Range<usize>, message: impl Into<String>) -> ParseError {
        ParseError::new(self.input, span, message)
    }

    fn parse_version(&self, lexeme: &Lexeme<'_>) -> Result<VersionConstraint, ParseError> {
        let text = &lexeme.text[1..];
        if text.is_empty() {
            return Err(self.error(lexeme.span.clone(), "missing version after '@'"));
        }
        VersionConstraint::parse(text).map_err(|e| self.error(lexeme.span.clone(), e.to_string()))
    }

    fn name(&mut self, lexeme: &Lexeme<'_>) -> Result<(), ParseError> {
        enum Slot {
            NewRoot,
            Fill,
            Misplaced,
        }
        let slot = match self.current() {
            None => Slot::NewRoot,
            Some(spec) if spec.name.is_some() => Slot::NewRoot,
            Some(spec) if spec.is_unconstrained() => Slot::Fill,
            Some(_) => Slot::Misplaced,
        };
        match slot {
            Slot::NewRoot => {
                self.roots.push(Spec::named(lexeme.text));
                self.cursor = Cursor::Root;
            }
            Slot::Fill => self.current_or_new().name = Some(lexeme.text.to_string()),
            Slot::Misplaced => {
                return Err(self.error(
                    lexeme.span.clone(),
                    "package name must come before its constraints",
                ));
            }
        }
        Ok(())
    }

    fn version(&mut self, lexeme: &Lexeme<'_>) -> Result<(), ParseError> {
        let versions = self.parse_version(lexeme)?;
        let spec = self.current_or_new();
        if !spec.versions.is_any() {
            return Err(self.error(lexeme.span.clone(), "version given twice"));
        }
        spec.versions = versions;
        Ok(())
    }

    fn bool_variant(&mut self, lexeme: &Lexeme<'_>) -> Result<(), ParseError> {
        let on = lexeme.text.starts_with('+');
        let name = lexeme.text[1..].to_string();
        let spec = self.current_or_new();
        if spec.variants.insert(name, VariantValue::Bool(on)).is_some() {
            return Err(self.error(lexeme.span.clone(), "variant given twice"));
        }
        Ok(())
    }

    fn key_value(&mut self, lexeme: &Lexeme<'_>) -> Result<(), ParseError> {
        let Some((key, value)) = lexeme.text.split_once('=') else {
            return Err(self.error(lexeme.span.clone(), "expected key=value"));
        };
        if key.contains(',') {
            return Err(self.error(lexeme.span.clone(), "invalid variant name"));
        }
        if value.is_empty() {
            return Err(self.error(lexeme.span.clone(), "missing value after '='"));
        }
        let spec = self.current_or_new();
        let duplicate = if key == "target" {
            spec.target.replace(value.to_string()).is_some()
        } else {
            spec.variants
                .insert(key.to_string(), VariantValue::from_assignment(value))
                .is_some()
        };
        if duplicate {
            return Err(self.error(lexeme.span.clone(), format!("'{key}' given twice")));
        }
        Ok(())
    }

    fn direct(
        &mut self,
        percent: &Lexeme<'_>,
        target: Option<&Lexeme<'_>>,
        version: Option<&Lexeme<'_>>,
    ) -> Result<(), ParseError> {
        let (languages, name) = match target {
            Some(l) if l.token == Token::Name => (Vec::new(), l.text),
            Some(l) if l.token == Token::KeyValue => {
                let (langs, name) = l.text.split_once('=').unwrap_or_default();
                if name.is_empty() {
                    return Err(self.error(l.span.clone(), "missing package after '='"));
                }
                let langs = langs
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                (langs, name)
            }
            _ => {
                return Err(self.error(percent.span.clone(), "expected a package name after '%'"));
            }
        };
        let mut dep = Spec::named(name);
        if let Some(version) = version {
            dep.versions = self.parse_version(version)?;
        }
        let constraint = DependencyConstraint {
            kind: DependencyKind::Direct { languages },
            spec: dep,
        };
        self.current_or_new().dependencies.push(constraint);
        Ok(())
    }

    fn transitive(&mut self, caret: &Lexeme<'_>, name: Option<&Lexeme<'_>>) -> Result<(), ParseError> {
        let Some(name) = name.filter(|l| l.token == Token::Name) else {
            return Err(self.error(caret.span.clone(), "expected a package name after '^'"));
        };
        let Some(root) = self.roots.last_mut() else {
            return Err(self.error(caret.span.clone(), "'^' must follow a spec"));
        };
        root.dependencies.push(DependencyConstraint {
            kind: DependencyKind::Transitive,
            spec: Spec::named(name.text),
        });
        self.cursor = Cursor::Nested(root.dependencies.len() - 1);
        Ok(())
    }
}

/// Parse one or more whitespace separated root specs.
pub fn parse_specs(input: &str) -> Result<Vec<Spec>, ParseError> {
    let lexemes = tokenize(input)?;
    let mut parser = SpecParser {
        input,
        roots: Vec::new(),
        cursor: Cursor::Root,
    };
    let mut i = 0;
    while i < lexemes.len() {
        let lexeme = &lexemes[i];
        match lexeme.token {
            Token::Name => parser.name(lexeme)?,
            Token::Version => parser.version(lexeme)?,
            Token::BoolVariant => parser.bool_variant(lexeme)?,
            Token::KeyValue => parser.key_value(lexeme)?,
            Token::Percent => {
                let target = lexemes.get(i + 1);
                // A version glued to the compiler name belongs to it.
                let version = lexemes.get(i + 2).filter(|v| {
                    v.token == Token::Version && target.is_some_and(|t| t.span.end == v.span.start)
                });
                parser.direct(lexeme, target, version)?;
                i += 1 + usize::from(target.is_some()) + usize::from(version.is_some());
                continue;
            }
            Token::Caret => {
                parser.transitive(lexeme, lexemes.get(i + 1))?;
                i += 2;
                continue;
            }
        }
        i += 1;
    }
    if parser.roots.is_empty() {
        return Err(ParseError::new(input, 0..input.len(), "empty spec"));
    }
    Ok(parser.roots)
}

/// Parse exactly one root spec (which may carry `^` dependencies).
pub fn parse_spec(input: &str) -> Result<Spec, ParseError> {
    let mut roots = parse_specs(input)?;
    if roots.len() > 1 {
        return Err(ParseError::new(
            input,
            0..input.len(),
            format!("expected a single spec, found {}", roots.len()),
        ));
    }
    Ok(roots.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;
    use proptest::prelude::*;

    #[test]
    fn parse_full_request() {
        let spec = parse_spec("hdf5@1.14: +mpi~fortran api=v18 target=zen3 %gcc@12 ^mpich@4 +cuda").unwrap();
        assert_eq!(spec.name.as_deref(), Some("hdf5"));
        assert!(spec.versions.matches(&Version::parse("1.14.3").unwrap()));
        assert_eq!(spec.variants["mpi"], VariantValue::Bool(true));
        assert_eq!(spec.variants["fortran"], VariantValue::Bool(false));
        assert_eq!(spec.variants["api"], VariantValue::Value("v18".into()));
        assert_eq!(spec.target.as_deref(), Some("zen3"));

        let direct: Vec<_> = spec.direct_dependencies().collect();
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].name(), "gcc");
        assert!(direct[0].spec.versions.matches(&Version::parse("12.3").unwrap()));

        let nested: Vec<_> = spec.transitive_dependencies().collect();
        assert_eq!(nested.len(), 1);
        assert_eq!(nested[0].name(), "mpich");
        assert_eq!(nested[0].spec.variants["cuda"], VariantValue::Bool(true));
    }

    #[test]
    fn language_scoped_compiler() {
        let spec = parse_spec("app %c,cxx=clang@17").unwrap();
        let dep = spec.direct_dependencies().next().unwrap();
        assert_eq!(
            dep.kind,
            DependencyKind::Direct {
                languages: vec!["c".into(), "cxx".into()]
            }
        );
        assert_eq!(dep.name(), "clang");
        assert!(!dep.spec.versions.is_any());
    }

    #[test]
    fn detached_version_belongs_to_the_spec() {
        let spec = parse_spec("app %gcc @2").unwrap();
        assert!(spec.versions.matches(&Version::parse("2.0").unwrap()));
        assert!(spec.direct_dependencies().next().unwrap().spec.versions.is_any());
    }

    #[test]
    fn multi_valued_variant() {
        let spec = parse_spec("kokkos cuda_arch=70,80").unwrap();
        assert_eq!(
            spec.variants["cuda_arch"],
            VariantValue::Set(["70".to_string(), "80".to_string()].into())
        );
    }

    #[test]
    fn anonymous_specs() {
        let spec = parse_spec("@2.1:+shared").unwrap();
        assert!(spec.name.is_none());
        assert_eq!(spec.variants["shared"], VariantValue::Bool(true));
    }

    #[test]
    fn several_roots() {
        let roots = parse_specs("hdf5+mpi zlib@1.3 ^cmake").unwrap();
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[1].name.as_deref(), Some("zlib"));
        assert_eq!(roots[1].transitive_dependencies().count(), 1);
        assert!(parse_spec("hdf5 zlib").is_err());
    }

    #[test]
    fn duplicate_version_is_rejected() {
        let err = parse_spec("zlib@1.2@1.3").unwrap_err();
        assert_eq!(err.message, "version given twice");
        assert_eq!(err.span, 8..12);
        assert!(err.render().ends_with("\n          ^^^^"));
    }

    #[test]
    fn malformed_inputs() {
        assert!(parse_spec("").is_err());
        assert!(parse_spec("zlib@").is_err());
        assert!(parse_spec("zlib ^").is_err());
        assert!(parse_spec("zlib %").is_err());
        assert!(parse_spec("zlib $").is_err());
        assert!(parse_spec("zlib+shared~shared").is_err());
        assert!(parse_spec("@1.2 zlib").is_err());
    }

    #[test]
    fn display_round_trips() {
        for text in [
            "hdf5@1.14:+mpi~shared api=v18 target=zen3 %gcc@12 ^mpich@4+cuda %clang ^zlib",
            "app %c,cxx=clang@17",
            "@2:+shared",
        ] {
            let spec = parse_spec(text).unwrap();
            let again = parse_spec(&spec.to_string()).unwrap();
            assert_eq!(spec, again, "{text} -> {spec}");
        }
    }

    fn flag(name: &'static str) -> impl Strategy<Value = String> {
        prop::option::of(any::<bool>()).prop_map(move |f| match f {
            Some(true) => format!("+{name}"),
            Some(false) => format!("~{name}"),
            None => String::new(),
        })
    }

    fn versions() -> impl Strategy<Value = String> {
        prop::option::of("[1-9][0-9]?(\\.[1-9][0-9]?){0,2}:?")
            .prop_map(|v| v.map(|v| format!("@{v}")).unwrap_or_default())
    }

    proptest! {
        #[test]
        fn requests_survive_display(
            name in "p[a-z0-9]{0,5}",
            version in versions(),
            shared in flag("shared"),
            debug in flag("debug"),
            compiler in prop::option::of(("gcc|clang", versions())),
            dep in prop::option::of(("d[a-z]{0,4}", versions(), flag("mpi"))),
        ) {
            let mut text = format!("{name}{version}{shared}{debug}");
            if let Some((compiler, version)) = compiler {
                text.push_str(&format!(" %{compiler}{version}"));
            }
            if let Some((dep, version, mpi)) = dep {
                text.push_str(&format!(" ^{dep}{version}{mpi}"));
            }
            let spec = parse_spec(&text).unwrap();
            let again = parse_spec(&spec.to_string()).unwrap();
            prop_assert_eq!(spec, again);
        }
    }
}
