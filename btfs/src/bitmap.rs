//! 位图工具
//!
//! 对不透明字节缓冲区做位扫描。第`n`位位于`buf[n / 8]`的第`n % 8`位（低位在前），
//! 与FAT卷上分配位图的排布一致。

/// 字节中最低的0位
#[inline]
pub fn lowest_zero_bit(byte: u8) -> Option<u32> {
    (byte != u8::MAX).then(|| byte.trailing_ones())
}

/// 字节中最低的1位
#[inline]
pub fn lowest_one_bit(byte: u8) -> Option<u32> {
    (byte != 0).then(|| byte.trailing_zeros())
}

/// 缓冲区前`bits`位中1的个数
pub fn count_ones(buf: &[u8], bits: usize) -> usize {
    let full = bits / 8;
    let mut count: usize = buf[..full].iter().map(|b| b.count_ones() as usize).sum();
    let rest = bits % 8;
    if rest > 0 {
        count += (buf[full] & ((1u8 << rest) - 1)).count_ones() as usize;
    }
    count
}

#[inline]
pub fn test(buf: &[u8], bit: usize) -> bool {
    buf[bit / 8] & (1 << (bit % 8)) != 0
}

#[inline]
pub fn set(buf: &mut [u8], bit: usize) {
    buf[bit / 8] |= 1 << (bit % 8);
}

#[inline]
pub fn clear(buf: &mut [u8], bit: usize) {
    buf[bit / 8] &= !(1 << (bit % 8));
}

/// `[from, limit)`内第一个0位
pub fn find_zero(buf: &[u8], from: usize, limit: usize) -> Option<usize> {
    find(buf, from, limit, |b| !b)
}

/// `[from, limit)`内第一个1位
pub fn find_one(buf: &[u8], from: usize, limit: usize) -> Option<usize> {
    find(buf, from, limit, |b| b)
}

/// 从`from`开始环绕搜索`[0, limit)`内的第一个0位
pub fn find_zero_wrapping(buf: &[u8], from: usize, limit: usize) -> Option<usize> {
    let from = if from >= limit { 0 } else { from };
    find_zero(buf, from, limit).or_else(|| find_zero(buf, 0, from))
}

/// 将待找的位统一转换为1再扫描，整字节跳过
fn find(buf: &[u8], from: usize, limit: usize, norm: impl Fn(u8) -> u8) -> Option<usize> {
    if from >= limit {
        return None;
    }

    let mut byte_idx = from / 8;
    // 首字节屏蔽`from`之前的位
    let mut byte = norm(buf[byte_idx]) & (u8::MAX << (from % 8));
    loop {
        if let Some(bit) = lowest_one_bit(byte) {
            let found = byte_idx * 8 + bit as usize;
            return (found < limit).then_some(found);
        }
        byte_idx += 1;
        if byte_idx * 8 >= limit {
            return None;
        }
        byte = norm(buf[byte_idx]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_bits() {
        assert_eq!(Some(0), lowest_zero_bit(0b1111_1110));
        assert_eq!(Some(3), lowest_zero_bit(0b0000_0111));
        assert_eq!(None, lowest_zero_bit(0xFF));
        assert_eq!(Some(4), lowest_one_bit(0b0001_0000));
        assert_eq!(None, lowest_one_bit(0));
    }

    #[test]
    fn population_count_respects_limit() {
        let buf = [0xFF, 0b0000_0101];
        assert_eq!(10, count_ones(&buf, 16));
        assert_eq!(9, count_ones(&buf, 9));
        assert_eq!(4, count_ones(&buf, 4));
    }

    #[test]
    fn search_skips_full_bytes() {
        let mut buf = [0xFF, 0xFF, 0b1110_1111, 0x00];
        assert_eq!(Some(20), find_zero(&buf, 0, 32));
        assert_eq!(Some(24), find_zero(&buf, 21, 32));
        assert_eq!(None, find_zero(&buf, 0, 20));

        set(&mut buf, 20);
        assert!(test(&buf, 20));
        assert_eq!(Some(24), find_zero(&buf, 0, 32));
        clear(&mut buf, 3);
        assert_eq!(Some(3), find_zero(&buf, 0, 32));

        assert_eq!(Some(0), find_one(&buf, 0, 32));
        assert_eq!(None, find_one(&buf, 24, 32));
    }

    #[test]
    fn wrapping_search() {
        let buf = [0b0000_0001, 0xFF];
        assert_eq!(Some(1), find_zero_wrapping(&buf, 9, 16));
        assert_eq!(None, find_zero_wrapping(&[0xFF], 3, 8));
        assert_eq!(Some(0), find_zero_wrapping(&[0xFE], 7, 8));
    }
}
