//! Symbol mangling for the generated assembly.
//!
//! The entry point is `mjMain`; the runtime externals are `print_int` and
//! `calloc_impl`. Class members are mangled as `__<Class>_M_<Method>` and
//! `__<Class>_I_<Field>`, with any underscore in a user name doubled so the
//! scheme stays injective.

/// Target platform, as far as symbol naming is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Platform {
    #[default]
    Linux,
    Darwin,
    Windows,
}

impl Platform {
    /// Darwin and Windows prepend an underscore to every external symbol.
    #[must_use]
    pub const fn symbol_prefix(self) -> &'static str {
        match self {
            Self::Linux => "",
            Self::Darwin | Self::Windows => "_",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Mangler {
    platform: Platform,
}

impl Mangler {
    #[must_use]
    pub const fn new(platform: Platform) -> Self {
        Self { platform }
    }

    /// Label of the program entry point.
    #[must_use]
    pub fn entry(&self) -> String {
        format!("{}mjMain", self.platform.symbol_prefix())
    }

    /// Label of the integer printing runtime helper.
    #[must_use]
    pub fn print_int(&self) -> String {
        format!("{}print_int", self.platform.symbol_prefix())
    }

    /// Label of the zeroing allocator runtime helper.
    #[must_use]
    pub fn calloc(&self) -> String {
        format!("{}calloc_impl", self.platform.symbol_prefix())
    }

    /// Label of a class method.
    #[must_use]
    pub fn method(&self, class: &str, method: &str) -> String {
        format!("__{}_M_{}", escape(class), escape(method))
    }

    /// Label of an instance field.
    #[must_use]
    pub fn field(&self, class: &str, field: &str) -> String {
        format!("__{}_I_{}", escape(class), escape(field))
    }
}

fn escape(name: &str) -> String {
    name.replace('_', "__")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_is_mj_main() {
        assert_eq!(Mangler::new(Platform::Linux).entry(), "mjMain");
    }

    #[test]
    fn darwin_prepends_underscore() {
        let m = Mangler::new(Platform::Darwin);
        assert_eq!(m.entry(), "_mjMain");
        assert_eq!(m.print_int(), "_print_int");
        assert_eq!(m.calloc(), "_calloc_impl");
    }

    #[test]
    fn windows_prepends_underscore() {
        assert_eq!(Mangler::new(Platform::Windows).print_int(), "_print_int");
    }

    #[test]
    fn method_mangling() {
        let m = Mangler::new(Platform::Linux);
        assert_eq!(m.method("List", "append"), "__List_M_append");
        assert_eq!(m.field("List", "head"), "__List_I_head");
    }

    #[test]
    fn user_underscores_are_doubled() {
        let m = Mangler::new(Platform::Linux);
        assert_eq!(m.method("My_Class", "do_it"), "__My__Class_M_do__it");
    }

    #[test]
    fn doubling_keeps_mangling_injective() {
        let m = Mangler::new(Platform::Linux);
        // "A_" + "B" and "A" + "_B" must not collide.
        assert_ne!(m.method("A_", "B"), m.method("A", "_B"));
    }
}
