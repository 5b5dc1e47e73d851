//! Run-time configuration.
//!
//! Every option carries a default value and a validator. Options can be set
//! programmatically, from `MANTLE_*` environment variables, or from a bulk
//! `key=value` string, and invalid values fall back to the default with a
//! warning rather than aborting initialization.

use std::fmt::Debug;
use strum_macros::EnumString;

use crate::util::constants::BYTES_IN_PAGE;

/// The mechanism used to bring a mutator to `Frozen`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumString)]
pub enum FreezeMechanism {
    /// A single compare-and-swap on the mutator state word arbitrates between
    /// the mutator's native-call epilogue and the VM-operation thread.
    Cas,
    /// A separate frozen flag with Dekker-style store-fence-load sequences.
    Fence,
}

fn always_valid<T>(_: &T) -> bool {
    true
}

/// An option of a given type, with a validator and provenance flags.
/// To get the value of an option, simply dereference it
/// (for example, `*options.region_size_in_bytes`).
#[derive(Clone)]
pub struct MantleOption<T: Debug + Clone> {
    /// The actual value for the option
    value: T,
    /// The validator to ensure the value is valid.
    validator: fn(&T) -> bool,
    /// Can we set this option through env vars?
    from_env_var: bool,
    /// Can we set this option through command line options/API?
    from_command_line: bool,
}

impl<T: Debug + Clone> MantleOption<T> {
    /// Create a new option.
    pub fn new(
        value: T,
        validator: fn(&T) -> bool,
        from_env_var: bool,
        from_command_line: bool,
    ) -> Self {
        debug_assert!(validator(&value), "default value {value:?} is invalid");
        MantleOption {
            value,
            validator,
            from_env_var,
            from_command_line,
        }
    }

    /// Set the option to the given value. Returns true if the value is valid,
    /// and we set the option to the value.
    pub fn set(&mut self, value: T) -> bool {
        if (self.validator)(&value) {
            self.value = value;
            return true;
        }
        false
    }
}

// Dereference an option to get its value.
impl<T: Debug + Clone> std::ops::Deref for MantleOption<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

macro_rules! options {
    // Verify whether we can set an option through env var or command line.
    (@verify_set_from($self: expr, $key: expr, $verify_field: ident, $($name: ident),*)) => {
        match $key {
            $(stringify!($name) => { assert!($self.$name.$verify_field, "cannot set option {} (not {})", $key, stringify!($verify_field)) }),*
            _ => panic!("Invalid Options key: {}", $key)
        }
    };

    ($($(#[$outer:meta])* $name:ident: $type:ty [env_var: $env_var:expr, command_line: $command_line:expr] [$validator:expr] = $default:expr),*,) => [
        /// The set of options for an instance of the heap. Created with
        /// defaults and optionally refined from the environment before
        /// [`crate::memory_manager::init`].
        #[derive(Clone)]
        pub struct Options {
            $($(#[$outer])* pub $name: MantleOption<$type>),*
        }

        impl Options {
            /// Set an option from an env var.
            pub fn set_from_env_var(&mut self, s: &str, val: &str) -> bool {
                options!(@verify_set_from(self, s, from_env_var, $($name),*));
                self.set_inner(s, val)
            }

            /// Set an option from the command line.
            pub fn set_from_command_line(&mut self, s: &str, val: &str) -> bool {
                options!(@verify_set_from(self, s, from_command_line, $($name),*));
                self.set_inner(s, val)
            }

            /// Bulk process options. Returns true if all the options are processed successfully.
            /// This method returns false if the option string is invalid, or if it includes any
            /// invalid option.
            ///
            /// Arguments:
            /// * `options`: a string of key value pairs separated by white spaces or commas,
            ///   e.g. `region_size_in_bytes=65536 use_rescan_map=true`.
            pub fn set_bulk_from_command_line(&mut self, options: &str) -> bool {
                for opt in options.replace(',', " ").split_ascii_whitespace() {
                    let kv_pair: Vec<&str> = opt.split('=').collect();
                    if kv_pair.len() != 2 {
                        return false;
                    }

                    let key = kv_pair[0];
                    let val = kv_pair[1];
                    if !self.set_from_command_line(key, val) {
                        return false;
                    }
                }

                true
            }

            /// Set an option and run its validator for its value.
            fn set_inner(&mut self, s: &str, val: &str) -> bool {
                match s {
                    // Parse the given value from str to the right type
                    $(stringify!($name) => if let Ok(typed_val) = val.parse::<$type>() {
                        let is_set = self.$name.set(typed_val);
                        if !is_set {
                            eprintln!("Warn: unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_set
                    } else {
                        eprintln!("Warn: unable to set {}={:?}. Can't parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => panic!("Invalid Options key: {}", s)
                }
            }

            /// Create an `Options` instance with built-in default settings.
            fn new() -> Self {
                Options {
                    $($name: MantleOption::new($default, $validator, $env_var, $command_line)),*
                }
            }

            /// Read options from environment variables, and apply those settings to self.
            ///
            /// If we have environment variables that start with `MANTLE_` and match any option
            /// (such as `MANTLE_REGION_SIZE_IN_BYTES`), we set the option to its value (if it is
            /// a valid value).
            pub fn read_env_var_settings(&mut self) {
                const PREFIX: &str = "MANTLE_";
                for (key, val) in std::env::vars() {
                    // strip the prefix, and get the lower case string
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { self.set_from_env_var(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
            }
        }

        impl Default for Options {
            /// By default, an `Options` instance is created with built-in default settings.
            fn default() -> Self {
                Self::new()
            }
        }
    ]
}

options! {
    /// Use the rescan map to recover from marking-stack overflow instead of
    /// the linear rescan.
    use_rescan_map: bool [env_var: true, command_line: true] [always_valid] = false,

    /// When flushing the marking stack on overflow, visit each flushed cell's
    /// references immediately and blacken it, so the recovery scan has less
    /// to redo. Only meaningful with the linear rescan strategy.
    use_deep_mark_stack_flush: bool [env_var: true, command_line: true] [always_valid] = false,

    /// The mechanism used to freeze mutator threads.
    freeze_mechanism: FreezeMechanism [env_var: true, command_line: true] [always_valid] = FreezeMechanism::Cas,

    /// How many times the VM-operation thread spins on a mutator's state word
    /// before it starts yielding and sleeping.
    safepoint_spin_before_yield: usize [env_var: true, command_line: true] [|v: &usize| *v > 0] = 2000,

    /// Report a mutator that has not reached its safepoint after this many
    /// wait iterations. 0 disables the report.
    freeze_debug_iterations: usize [env_var: true, command_line: true] [always_valid] = 0,

    /// How many heap words each mark-bitmap bit covers. Must be a power of two.
    words_covered_per_bit: usize [env_var: true, command_line: true] [|v: &usize| v.is_power_of_two()] = 1,

    /// The size of a heap region in bytes. A power of two, at least one page.
    region_size_in_bytes: usize [env_var: true, command_line: true] [|v: &usize| v.is_power_of_two() && *v >= BYTES_IN_PAGE] = 1 << 20,

    /// The capacity of the marking stack, in entries. Must be a power of two.
    mark_stack_capacity: usize [env_var: true, command_line: true] [|v: &usize| v.is_power_of_two()] = 1 << 14,

    /// The smallest chunk that may be installed in a multi-chunk TLAB.
    /// Leftover space below this threshold is filled with dead objects
    /// instead of being returned to the free list.
    tlab_min_chunk_size: usize [env_var: true, command_line: true] [|v: &usize| *v >= crate::util::heap::free_chunk::HEADER_BYTES] = 256,

    /// The smallest inter-cell gap worth reporting to the sweeper during an
    /// imprecise sweep. Shorter gaps are filled with dead objects in place.
    min_reclaimable_space: usize [env_var: true, command_line: true] [|v: &usize| *v >= crate::util::heap::free_chunk::HEADER_BYTES] = 256,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let options = Options::default();
        assert!(!*options.use_rescan_map);
        assert_eq!(*options.freeze_mechanism, FreezeMechanism::Cas);
        assert_eq!(*options.words_covered_per_bit, 1);
        assert!((*options.region_size_in_bytes).is_power_of_two());
    }

    #[test]
    fn set_bulk() {
        let mut options = Options::default();
        assert!(options
            .set_bulk_from_command_line("region_size_in_bytes=65536,use_rescan_map=true"));
        assert_eq!(*options.region_size_in_bytes, 65536);
        assert!(*options.use_rescan_map);
    }

    #[test]
    fn reject_invalid() {
        let mut options = Options::default();
        // not a power of two: the default must survive
        assert!(!options.set_from_command_line("region_size_in_bytes", "100000"));
        assert_eq!(*options.region_size_in_bytes, 1 << 20);
    }

    #[test]
    fn parse_freeze_mechanism() {
        let mut options = Options::default();
        assert!(options.set_from_command_line("freeze_mechanism", "Fence"));
        assert_eq!(*options.freeze_mechanism, FreezeMechanism::Fence);
    }
}
