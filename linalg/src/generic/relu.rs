ew_impl_wrap!(
    f32,
    SRelu4,
    4,
    4,
    f32,
    fn run(xs: &mut [f32], limit: f32) {
        debug_assert!(xs.len() % Self::nr() == 0);
        debug_assert!(xs.as_ptr() as usize % Self::alignment_bytes() == 0);
        xs.iter_mut().for_each(|x| *x = x.max(0.0).min(limit))
    }
);
