//! Type descriptors: `I`, `J`, `Ljava/lang/String;`, `[[D`, `(IJ)V`.

use super::InjectError;
use super::insn::ValueKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<ValueKind>,
    /// `None` for `V`.
    pub ret: Option<ValueKind>,
}

impl Signature {
    /// Words taken by the parameters (not counting a receiver).
    pub fn param_words(&self) -> u16 {
        self.params.iter().map(|k| k.size()).sum()
    }
}

pub fn parse_method(desc: &str) -> Result<Signature, InjectError> {
    let malformed = || InjectError::Descriptor(desc.to_string());
    let rest = desc.strip_prefix('(').ok_or_else(malformed)?;
    let (params_text, ret_text) = rest.split_once(')').ok_or_else(malformed)?;

    let mut params = Vec::new();
    let mut cursor = params_text;
    while !cursor.is_empty() {
        let (kind, tail) = parse_one(cursor).ok_or_else(malformed)?;
        params.push(kind);
        cursor = tail;
    }

    let ret = if ret_text == "V" {
        None
    } else {
        match parse_one(ret_text) {
            Some((kind, "")) => Some(kind),
            _ => return Err(malformed()),
        }
    };
    Ok(Signature { params, ret })
}

/// Kind of a single field descriptor.
pub fn parse_field(desc: &str) -> Result<ValueKind, InjectError> {
    match parse_one(desc) {
        Some((kind, "")) => Ok(kind),
        _ => Err(InjectError::Descriptor(desc.to_string())),
    }
}

fn parse_one(text: &str) -> Option<(ValueKind, &str)> {
    let first = *text.as_bytes().first()?;
    let tail = &text[1..];
    match first {
        b'B' | b'C' | b'I' | b'S' | b'Z' => Some((ValueKind::Int, tail)),
        b'J' => Some((ValueKind::Long, tail)),
        b'F' => Some((ValueKind::Float, tail)),
        b'D' => Some((ValueKind::Double, tail)),
        b'L' => {
            let end = tail.find(';')?;
            (end > 0).then(|| (ValueKind::Ref, &tail[end + 1..]))
        }
        b'[' => {
            let (_, after) = parse_one(tail)?;
            Some((ValueKind::Ref, after))
        }
        _ => None,
    }
}

/// Reduce an array-of-objects descriptor (`[[Lpkg/T;`) to the element
/// class name (`pkg/T`). Anything else is returned unchanged.
pub fn element_class_name(type_name: &str) -> &str {
    let trimmed = type_name.trim_start_matches('[');
    match trimmed.strip_prefix('L').and_then(|s| s.strip_suffix(';')) {
        Some(inner) if !inner.is_empty() && !inner.contains(';') => inner,
        _ => type_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_method_descriptors() {
        let sig = parse_method("(IJLjava/lang/String;[[D)V").unwrap();
        assert_eq!(
            sig.params,
            vec![ValueKind::Int, ValueKind::Long, ValueKind::Ref, ValueKind::Ref]
        );
        assert_eq!(sig.ret, None);
        assert_eq!(sig.param_words(), 5);

        let sig = parse_method("()[Ljava/lang/Object;").unwrap();
        assert!(sig.params.is_empty());
        assert_eq!(sig.ret, Some(ValueKind::Ref));
    }

    #[test]
    fn rejects_malformed_descriptors() {
        assert!(parse_method("I)V").is_err());
        assert!(parse_method("(Ljava/lang/String)V").is_err());
        assert!(parse_method("(I)").is_err());
        assert!(parse_method("(Q)V").is_err());
        assert!(parse_field("JJ").is_err());
    }

    #[test]
    fn field_kinds() {
        assert_eq!(parse_field("Z").unwrap(), ValueKind::Int);
        assert_eq!(parse_field("D").unwrap(), ValueKind::Double);
        assert_eq!(parse_field("[I").unwrap(), ValueKind::Ref);
    }

    #[test]
    fn strips_object_array_descriptors() {
        assert_eq!(element_class_name("[[Lpkg/T;"), "pkg/T");
        assert_eq!(element_class_name("Lpkg/T;"), "pkg/T");
        assert_eq!(element_class_name("java/lang/String"), "java/lang/String");
        assert_eq!(element_class_name("[[I"), "[[I");
    }
}
