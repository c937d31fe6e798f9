#[macro_export]
macro_rules! tvec {
    // count helper: transform any expression into 1
    (@one $x:expr) => (1usize);
    ($elem:expr; $n:expr) => ({
        $crate::TVec::from_elem($elem, $n)
    });
    ($($x:expr),*$(,)*) => ({
        let count = 0usize $(+ tvec!(@one $x))*;
        #[allow(unused_mut)]
        let mut vec = $crate::TVec::new();
        if count <= vec.inline_size() {
            $(vec.push($x);)*
            vec
        } else {
            $crate::TVec::from_vec(vec![$($x,)*])
        }
    });
}

/// Call a generic function with the storage type matching a DatumType.
///
/// Quantized types dispatch to their storage type (`u8` or `i8`).
#[macro_export]
macro_rules! dispatch_copy {
    ($($path:ident)::* ($dt:expr) ($($args:expr),*)) => { {
        use $crate::prelude::DatumType;
        match $dt {
            DatumType::Bool => $($path)::*::<bool>($($args),*),
            DatumType::U8   => $($path)::*::<u8>($($args),*),
            DatumType::I8   => $($path)::*::<i8>($($args),*),
            DatumType::I32  => $($path)::*::<i32>($($args),*),
            DatumType::F32  => $($path)::*::<f32>($($args),*),
            DatumType::QU8(_)  => $($path)::*::<u8>($($args),*),
            DatumType::QI8(_)  => $($path)::*::<i8>($($args),*),
        }
    } }
}

/// Same as dispatch_copy, without Bool.
#[macro_export]
macro_rules! dispatch_numbers {
    ($($path:ident)::* ($dt:expr) ($($args:expr),*)) => { {
        use $crate::prelude::DatumType;
        match $dt {
            DatumType::U8   => $($path)::*::<u8>($($args),*),
            DatumType::I8   => $($path)::*::<i8>($($args),*),
            DatumType::I32  => $($path)::*::<i32>($($args),*),
            DatumType::F32  => $($path)::*::<f32>($($args),*),
            DatumType::QU8(_)  => $($path)::*::<u8>($($args),*),
            DatumType::QI8(_)  => $($path)::*::<i8>($($args),*),
            _ => $crate::anyhow::bail!("{:?} is not a number", $dt)
        }
    } }
}

/// Dispatch over the two quantized storage types.
#[macro_export]
macro_rules! dispatch_quantized {
    ($($path:ident)::* ($dt:expr) ($($args:expr),*)) => { {
        use $crate::prelude::DatumType;
        match $dt {
            DatumType::QU8(_)  => $($path)::*::<u8>($($args),*),
            DatumType::QI8(_)  => $($path)::*::<i8>($($args),*),
            _ => $crate::anyhow::bail!("{:?} is not a quantized type", $dt)
        }
    } }
}
