/// Declarative macro for defining syscall handlers with composable requirements.
///
/// # Syntax
///
/// ```ignore
/// define_syscall!(handler_name(ctx, args) { body });
/// define_syscall!(handler_name(ctx, args) requires(let process) { body });
/// ```
///
/// | Syntax        | Effect                                          |
/// |---------------|-------------------------------------------------|
/// | `let $name`   | Binds the calling process via `require_process` |
///
/// The body evaluates to a `SyscallResult`.
#[macro_export]
macro_rules! define_syscall {
    ($name:ident($ctx:ident, $args:ident) $body:block) => {
        $crate::define_syscall!(@impl $name, $ctx, $args, [], $body);
    };

    ($name:ident($ctx:ident, $args:ident) requires($($req:tt)*) $body:block) => {
        $crate::define_syscall!(@impl $name, $ctx, $args, [$($req)*], $body);
    };

    (@impl $name:ident, $ctx:ident, $args:ident, [$($req:tt)*], $body:block) => {
        #[allow(unused_variables)]
        pub fn $name(
            $ctx: &$crate::syscall::context::SyscallContext,
        ) -> $crate::syscall::common::SyscallResult {
            $crate::define_syscall!(@expand_reqs $ctx, $($req)*);
            #[allow(unused_variables)]
            let $args = $ctx.args();
            $body
        }
    };

    (@expand_reqs $ctx:ident,) => {};

    (@expand_reqs $ctx:ident, let $binding:ident $(, $($rest:tt)*)?) => {
        #[allow(unused_variables)]
        let $binding = $ctx.require_process()?;
        $($crate::define_syscall!(@expand_reqs $ctx, $($rest)*);)?
    };
}
