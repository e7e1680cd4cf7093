//! CPython harness template

pub(crate) const TEMPLATE: &str = r#"# Generated by polyrun. Loads the function module, invokes its handler and
# records output and logs in the workspace.
import asyncio
import atexit
import importlib.util
import inspect
import json
import os
import sys
import time
import traceback

sys.dont_write_bytecode = True

WORKSPACE = os.path.dirname(os.path.abspath(__file__))
HANDLER_SEGMENTS = {{HANDLER_SEGMENTS}}
ENTRY_SEGMENT = {{ENTRY_SEGMENT}}
SOURCE_FILE = {{SOURCE_FILE}}
INPUT_FILE = {{INPUT_FILE}}
OUTPUT_FILE = {{OUTPUT_FILE}}
LOG_FILE = {{LOG_FILE}}

EXIT_OK = {{EXIT_OK}}
EXIT_HANDLER_ERROR = {{EXIT_HANDLER_ERROR}}
EXIT_HARNESS_ERROR = {{EXIT_HARNESS_ERROR}}

logs = []


class LineCapture(object):
    def __init__(self, original):
        self._original = original
        self._pending = ""

    def write(self, text):
        if not isinstance(text, str):
            text = str(text)
        self._pending += text
        while "\n" in self._pending:
            line, self._pending = self._pending.split("\n", 1)
            logs.append(line)
        if self._original is not None:
            try:
                self._original.write(text)
            except Exception:
                pass
        return len(text)

    def flush(self):
        if self._original is not None:
            try:
                self._original.flush()
            except Exception:
                pass

    def drain(self):
        if self._pending:
            logs.append(self._pending)
            self._pending = ""

    def isatty(self):
        return False

    def __getattr__(self, name):
        return getattr(self._original, name)


stdout_capture = LineCapture(sys.stdout)
stderr_capture = LineCapture(sys.stderr)


def flush_logs():
    stdout_capture.drain()
    stderr_capture.drain()
    try:
        with open(os.path.join(WORKSPACE, LOG_FILE), "w") as handle:
            handle.write("\n".join(logs))
    except OSError:
        pass


atexit.register(flush_logs)


class HandlerNotFoundError(Exception):
    pass


def resolve_handler(module):
    handler_name = ".".join(HANDLER_SEGMENTS)
    if HANDLER_SEGMENTS[0] == ENTRY_SEGMENT:
        walk = HANDLER_SEGMENTS[1:]
    else:
        walk = list(HANDLER_SEGMENTS)
    target = module
    for segment in walk:
        if not hasattr(target, segment):
            raise HandlerNotFoundError(
                "Handler '%s' not found: '%s' is not defined" % (handler_name, segment)
            )
        target = getattr(target, segment)
    if not callable(target):
        raise HandlerNotFoundError(
            "Handler '%s' not found: '%s' is not callable" % (handler_name, walk[-1])
        )
    return target


class ExecutionContext(object):
    def __init__(self):
        env = os.environ
        self.execution_id = env.get("POLYRUN_EXECUTION_ID", "")
        self.function_id = env.get("POLYRUN_FUNCTION_ID", "")
        self.function_name = env.get("POLYRUN_FUNCTION_NAME", "")
        self.memory_limit_in_mb = int(env.get("POLYRUN_MEMORY_LIMIT_MB") or 0)
        self.timeout_seconds = int(env.get("POLYRUN_TIMEOUT_SECONDS") or 0)
        self._deadline_ms = int(env.get("POLYRUN_DEADLINE_MS") or 0)

    def get_remaining_time_in_millis(self):
        if self._deadline_ms <= 0:
            return 0
        return max(0, self._deadline_ms - int(time.time() * 1000))


def write_output(value):
    serialized = json.dumps(value, allow_nan=False)
    with open(os.path.join(WORKSPACE, OUTPUT_FILE), "w") as handle:
        handle.write(serialized)


def error_message(error):
    return str(error) or type(error).__name__


def fail(message, detail, exit_code):
    logs.append(detail.rstrip("\n"))
    try:
        write_output({"error": message})
    except Exception:
        pass
    sys.exit(exit_code)


async def await_result(awaitable):
    return await awaitable


def main():
    sys.stdout = stdout_capture
    sys.stderr = stderr_capture

    try:
        with open(os.path.join(WORKSPACE, INPUT_FILE)) as handle:
            payload = json.load(handle)
        sys.path.insert(0, WORKSPACE)
        spec = importlib.util.spec_from_file_location(
            ENTRY_SEGMENT, os.path.join(WORKSPACE, SOURCE_FILE)
        )
        module = importlib.util.module_from_spec(spec)
        sys.modules[ENTRY_SEGMENT] = module
        spec.loader.exec_module(module)
        handler = resolve_handler(module)
    except Exception as error:
        fail(error_message(error), traceback.format_exc(), EXIT_HARNESS_ERROR)

    try:
        result = handler(payload, ExecutionContext())
        if inspect.isawaitable(result):
            result = asyncio.run(await_result(result))
    except Exception as error:
        fail(error_message(error), traceback.format_exc(), EXIT_HANDLER_ERROR)

    try:
        write_output(result)
    except Exception as error:
        fail(
            "Handler result is not JSON serializable: %s" % error_message(error),
            traceback.format_exc(),
            EXIT_HANDLER_ERROR,
        )

    sys.exit(EXIT_OK)


if __name__ == "__main__":
    main()
"#;
