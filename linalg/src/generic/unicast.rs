macro_rules! generic_unicast {
    ($func: ident, |$a: ident, $b: ident| $body: expr) => {
        unicast_impl_wrap!(
            f32,
            $func,
            4,
            4,
            fn run(a: &mut [f32], b: &[f32]) {
                debug_assert!(a.len() == b.len());
                debug_assert!(a.len() % Self::nr() == 0);
                a.iter_mut().zip(b.iter()).for_each(|($a, $b)| *$a = $body)
            }
        );
    };
}

generic_unicast!(SUnicastAdd4, |a, b| *a + *b);
generic_unicast!(SUnicastSub4, |a, b| *a - *b);
generic_unicast!(SUnicastMul4, |a, b| *a * *b);
generic_unicast!(SUnicastMin4, |a, b| a.min(*b));
generic_unicast!(SUnicastMax4, |a, b| a.max(*b));
