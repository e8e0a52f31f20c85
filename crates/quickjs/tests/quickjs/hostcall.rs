use anyhow::Result;

use super::common::{run, with_python};

#[test]
fn callables_are_invoked_from_script() -> Result<()> {
    with_python(|py| {
        run(
            py,
            r#"
            ctx = Context()
            ctx.add_callable("answer", lambda: 42)
            assert ctx.eval("answer()") == 42

            def concat(a, b):
                return a + b

            ctx.add_callable("concat", concat)
            assert ctx.eval("concat(40, 2)") == 42
            assert ctx.eval("concat('a', 'b')") == "ab"
            assert ctx.eval("typeof concat") == "function"
            assert ctx.eval("concat.name") == "concat"

            concat_fn = ctx.get("concat")
            assert ctx.eval("((f, a, b) => 22 + f(a, b))")(concat_fn, 10, 10) == 42
            assert concat_fn(1, 2) == 3
            "#,
        )?;
        Ok(())
    })
}

#[test]
fn callables_receive_converted_arguments() -> Result<()> {
    with_python(|py| {
        run(
            py,
            r#"
            ctx = Context()
            seen = []

            def record(*args):
                seen.extend(args)

            ctx.add_callable("record", record)
            ctx.eval("record(1, 2.5, 'x', true, null, undefined, 2n ** 70n)")
            assert seen == [1, 2.5, "x", True, None, None, 2 ** 70], seen
            assert isinstance(seen[3], bool)

            seen.clear()
            ctx.eval("record({a: 1}, [1, 2], () => 3)")
            assert all(isinstance(value, Object) for value in seen)
            assert seen[0].json() == '{"a":1}'
            assert seen[2]() == 3
            "#,
        )?;
        Ok(())
    })
}

#[test]
fn callables_can_reenter_their_runtime() -> Result<()> {
    with_python(|py| {
        run(
            py,
            r#"
            ctx = Context()

            def nested():
                return ctx.eval("40 + 2")

            def describe(obj):
                return obj.json()

            def apply(fn, value):
                return fn(value)

            ctx.add_callable("nested", nested)
            ctx.add_callable("describe", describe)
            ctx.add_callable("apply", apply)

            assert ctx.eval("nested()") == 42
            assert ctx.eval("describe({k: [true]})") == '{"k":[true]}'
            assert ctx.eval("apply((x) => x * 2, 21)") == 42
            assert ctx.eval("apply((x) => nested() + x, 1)") == 43
            "#,
        )?;
        Ok(())
    })
}

#[test]
fn python_errors_propagate_with_their_cause() -> Result<()> {
    with_python(|py| {
        run(
            py,
            r#"
            ctx = Context()

            def fail(message):
                raise ValueError(message)

            ctx.add_callable("fail", fail)
            err = raises(PythonError, ctx.eval, "fail('A')", match="Python call failed")
            assert isinstance(err, JSException)
            assert isinstance(err.__cause__, ValueError)
            assert str(err.__cause__) == "A"

            err = raises(JSException, ctx.eval, "(function() { fail('B'); })()")
            assert isinstance(err.__cause__, ValueError)
            assert str(err.__cause__) == "B"
            "#,
        )?;
        Ok(())
    })
}

#[test]
fn python_errors_are_catchable_in_script() -> Result<()> {
    with_python(|py| {
        run(
            py,
            r#"
            ctx = Context()

            def fail():
                raise KeyError("missing")

            ctx.add_callable("fail", fail)
            result = ctx.eval("""
                let caught;
                try { fail(); } catch (e) {
                    caught = [e instanceof PythonError, e instanceof Error, e.name, e.message];
                }
                caught
            """)
            import json
            is_python, is_error, name, message = json.loads(result.json())
            assert is_python and is_error
            assert name == "PythonError"
            assert "Python call failed" in message and "missing" in message

            # The caught error does not leak into later calls.
            assert ctx.eval("1 + 1") == 2

            # Rethrowing keeps the link to the original exception.
            err = raises(PythonError, ctx.eval, "try { fail(); } catch (e) { throw e; }")
            assert isinstance(err.__cause__, KeyError)
            "#,
        )?;
        Ok(())
    })
}

#[test]
fn unsupported_return_values_throw_in_script() -> Result<()> {
    with_python(|py| {
        run(
            py,
            r#"
            ctx = Context()
            ctx.add_callable("bad", lambda: [1, 2])
            raises(JSException, ctx.eval, "bad()", match="TypeError")
            assert ctx.eval("try { bad(); 'no' } catch (e) { e instanceof TypeError }") is True

            other = Context()
            foreign = other.eval("({})")
            ctx.add_callable("foreign", lambda: foreign)
            raises(JSException, ctx.eval, "foreign()", match="Can not mix")
            "#,
        )?;
        Ok(())
    })
}

#[test]
fn add_callable_validates_its_arguments() -> Result<()> {
    with_python(|py| {
        run(
            py,
            r#"
            ctx = Context()
            raises(TypeError, ctx.add_callable, "not_callable", 1, match="Argument must be callable.")

            ctx.eval("""
                Object.defineProperty(globalThis, "obj", {
                    value: "test",
                    writable: false,
                });
            """)
            raises(TypeError, ctx.add_callable, "obj", lambda: None, match="Failed adding the callable.")
            assert ctx.get("obj") == "test"
            "#,
        )?;
        Ok(())
    })
}

#[test]
fn callables_are_refused_under_a_time_limit() -> Result<()> {
    with_python(|py| {
        run(
            py,
            r#"
            ctx = Context()
            ctx.add_callable("f", lambda: 1)
            ctx.set_time_limit(10)
            raises(JSException, ctx.eval, "f()", match="Can not call into Python with a time limit set.")
            ctx.set_time_limit(-1)
            assert ctx.eval("f()") == 1
            "#,
        )?;
        Ok(())
    })
}
