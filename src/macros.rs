//! Internal macros.
//!
//! The on-disk header structs store multi-byte fields as zerocopy
//! little-endian wrappers (`U16`, `U32`, `U64`). Those wrappers all expose
//! `get`/`set`, so one macro arm covers every field width: `le_accessors!`
//! expands each `name: native_type` pair into a getter returning the native
//! integer and a `set_name` setter taking one.

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! le_accessors {
    ($($field:ident : $native:ty),* $(,)?) => {
        ::paste::paste! {
            $(
                #[inline]
                pub fn $field(&self) -> $native {
                    self.$field.get()
                }

                #[inline]
                pub fn [<set_ $field>](&mut self, val: $native) {
                    self.$field.set(val);
                }
            )*
        }
    };
}
