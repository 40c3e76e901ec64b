use core::mem::MaybeUninit;

use super::Init;

/// Untyped storage of the specified size and alignment. Used as backing
/// memory for thread stacks.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AlignedStorage<const LEN: usize, const ALIGN: usize>(
    elain::Align<ALIGN>,
    [MaybeUninit<u8>; LEN],
)
where
    elain::Align<ALIGN>: elain::Alignment;

impl<const LEN: usize, const ALIGN: usize> Init for AlignedStorage<LEN, ALIGN>
where
    elain::Align<ALIGN>: elain::Alignment,
{
    const INIT: Self = Self(elain::Align::NEW, [MaybeUninit::uninit(); LEN]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_align() {
        use core::alloc::Layout;

        macro_rules! check {
            ($len:expr, $align:expr) => {{
                let layout = Layout::new::<AlignedStorage<$len, $align>>();
                assert_eq!(layout.align(), $align);
                assert_eq!(layout.size(), ($len + $align - 1) / $align * $align);
            }};
        }

        check!(0, 4);
        check!(1, 4);
        check!(100, 4);
        check!(128, 16);
        check!(1000, 16);
        check!(4096, 1024);
    }
}
