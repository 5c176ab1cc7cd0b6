//! 名称规范化

use crate::config::MAX_NAME_LEN;
use crate::{Error, Result};

const INVALID_CHARS: &[char] = &['"', '*', '/', ':', '<', '>', '?', '\\', '|'];

/// 去掉末尾的空格与点，并检查名称是否可用
pub fn canonical_name(name: &str) -> Result<&str> {
    let name = name.trim_end_matches([' ', '.']);
    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::Invalid);
    }
    if name.chars().any(|c| c.is_control() || INVALID_CHARS.contains(&c)) {
        return Err(Error::Invalid);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::TooLong);
    }
    Ok(name)
}

/// 名称比较不区分ASCII大小写
#[inline]
pub fn names_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// 8.3短名称基底：转为大写，非法字符换成`_`，主名与扩展名以空格补齐
pub fn short_name_basis(name: &str) -> [u8; 11] {
    let mut arr = [b' '; 11];
    let (base, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot + 1..]),
        _ => (name, ""),
    };

    let legal = |b: u8| {
        if b.is_ascii_alphanumeric() || b"!#$%&'()-@^_`{}~".contains(&b) {
            b.to_ascii_uppercase()
        } else {
            b'_'
        }
    };
    let base = base.bytes().filter(|&b| b != b' ' && b != b'.');
    for (slot, b) in arr[..8].iter_mut().zip(base) {
        *slot = legal(b);
    }
    for (slot, b) in arr[8..].iter_mut().zip(ext.bytes().filter(|&b| b != b' ')) {
        *slot = legal(b);
    }
    // 0xE5与0x00开头有特殊含义
    if arr[0] == b' ' {
        arr[0] = b'_';
    }
    arr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize() {
        assert_eq!(Ok("notes"), canonical_name("notes. ."));
        assert_eq!(Err(Error::Invalid), canonical_name(".."));
        assert_eq!(Err(Error::Invalid), canonical_name("a/b"));
        assert_eq!(Err(Error::Invalid), canonical_name("   "));
        assert_eq!(Err(Error::TooLong), canonical_name(&"x".repeat(256)));
        assert!(canonical_name(&"x".repeat(255)).is_ok());
        assert!(names_equal("Readme.MD", "README.md"));
    }

    #[test]
    fn basis() {
        assert_eq!(*b"README  MD ", short_name_basis("readme.md"));
        assert_eq!(*b"ARCHIVE_TAR", short_name_basis("archive+x.tar"));
        assert_eq!(*b"BASHRC     ", short_name_basis(".bashrc"));
        assert_eq!(*b"A_BTAR  GZ ", short_name_basis("a+b.tar.gz"));
    }
}
