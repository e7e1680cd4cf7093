//! Node.js harness template

pub(crate) const TEMPLATE: &str = r#"'use strict';
// Generated by polyrun. Loads the function module, invokes its handler and
// records output and logs in the workspace.
const fs = require('fs');
const path = require('path');

const WORKSPACE = __dirname;
const HANDLER_SEGMENTS = {{HANDLER_SEGMENTS}};
const ENTRY_SEGMENT = {{ENTRY_SEGMENT}};
const SOURCE_FILE = {{SOURCE_FILE}};
const INPUT_FILE = {{INPUT_FILE}};
const OUTPUT_FILE = {{OUTPUT_FILE}};
const LOG_FILE = {{LOG_FILE}};

const EXIT_OK = {{EXIT_OK}};
const EXIT_HANDLER_ERROR = {{EXIT_HANDLER_ERROR}};
const EXIT_HARNESS_ERROR = {{EXIT_HARNESS_ERROR}};

const logs = [];
const pending = new Map();

function capture(stream) {
  const write = stream.write.bind(stream);
  pending.set(stream, '');
  stream.write = function (chunk, encoding, callback) {
    const text = typeof chunk === 'string'
      ? chunk
      : Buffer.from(chunk).toString(typeof encoding === 'string' ? encoding : 'utf8');
    let buffered = pending.get(stream) + text;
    let newline = buffered.indexOf('\n');
    while (newline !== -1) {
      logs.push(buffered.slice(0, newline));
      buffered = buffered.slice(newline + 1);
      newline = buffered.indexOf('\n');
    }
    pending.set(stream, buffered);
    return write(chunk, encoding, callback);
  };
}

function flushLogs() {
  for (const [stream, rest] of pending) {
    if (rest.length > 0) {
      logs.push(rest);
      pending.set(stream, '');
    }
  }
  try {
    fs.writeFileSync(path.join(WORKSPACE, LOG_FILE), logs.join('\n'));
  } catch (_) {
    // workspace already gone
  }
}

capture(process.stdout);
capture(process.stderr);
process.on('exit', flushLogs);

class HandlerNotFoundError extends Error {
  constructor(handler, segment, reason) {
    super(`Handler '${handler}' not found: '${segment}' ${reason}`);
    this.name = 'HandlerNotFoundError';
  }
}

function resolveHandler(moduleExports) {
  const handlerName = HANDLER_SEGMENTS.join('.');
  const walk = HANDLER_SEGMENTS[0] === ENTRY_SEGMENT
    ? HANDLER_SEGMENTS.slice(1)
    : HANDLER_SEGMENTS.slice();
  let owner = null;
  let target = moduleExports;
  for (const segment of walk) {
    if (target === null || target === undefined || !(segment in Object(target))) {
      throw new HandlerNotFoundError(handlerName, segment, 'is not defined');
    }
    owner = target;
    target = target[segment];
  }
  if (typeof target !== 'function') {
    throw new HandlerNotFoundError(handlerName, walk[walk.length - 1], 'is not a function');
  }
  return { owner, fn: target };
}

function errorMessage(error) {
  if (error instanceof Error) {
    return error.message || error.name || String(error);
  }
  if (typeof error === 'string') {
    return error;
  }
  try {
    return JSON.stringify(error);
  } catch (_) {
    return String(error);
  }
}

function writeOutput(value) {
  const serialized = JSON.stringify(value === undefined ? null : value);
  fs.writeFileSync(path.join(WORKSPACE, OUTPUT_FILE), serialized === undefined ? 'null' : serialized);
}

function fail(error, exitCode) {
  const message = errorMessage(error);
  logs.push(error instanceof Error && error.stack ? error.stack : message);
  try {
    writeOutput({ error: message });
  } catch (_) {
    // exit code still reports the failure
  }
  process.exit(exitCode);
}

// One-shot latch: the first of callback, returned value or promise wins.
let settled = false;

function complete(error, result) {
  if (settled) {
    return;
  }
  settled = true;
  if (error) {
    fail(error, EXIT_HANDLER_ERROR);
    return;
  }
  try {
    writeOutput(result);
  } catch (serializationError) {
    serializationError.message = 'Handler result is not JSON serializable: ' + errorMessage(serializationError);
    fail(serializationError, EXIT_HANDLER_ERROR);
    return;
  }
  process.exit(EXIT_OK);
}

function buildContext() {
  const env = process.env;
  const deadline = Number(env.POLYRUN_DEADLINE_MS || 0);
  return {
    executionId: env.POLYRUN_EXECUTION_ID || '',
    functionId: env.POLYRUN_FUNCTION_ID || '',
    functionName: env.POLYRUN_FUNCTION_NAME || '',
    memoryLimitInMB: Number(env.POLYRUN_MEMORY_LIMIT_MB || 0),
    timeoutSeconds: Number(env.POLYRUN_TIMEOUT_SECONDS || 0),
    getRemainingTimeInMillis() {
      return deadline > 0 ? Math.max(0, deadline - Date.now()) : 0;
    },
  };
}

function isThenable(value) {
  return value !== null
    && (typeof value === 'object' || typeof value === 'function')
    && typeof value.then === 'function';
}

function main() {
  let input;
  let handler;
  try {
    input = JSON.parse(fs.readFileSync(path.join(WORKSPACE, INPUT_FILE), 'utf8'));
    handler = resolveHandler(require(path.join(WORKSPACE, SOURCE_FILE)));
  } catch (error) {
    settled = true;
    fail(error, EXIT_HARNESS_ERROR);
    return;
  }

  process.on('uncaughtException', (error) => complete(error || new Error('Uncaught exception')));
  process.on('unhandledRejection', (reason) => complete(reason || new Error('Unhandled promise rejection')));

  let returned;
  try {
    returned = handler.fn.call(handler.owner, input, buildContext(), (error, result) => complete(error, result));
  } catch (error) {
    complete(error || new Error('Handler threw a falsy value'));
    return;
  }

  if (isThenable(returned)) {
    returned.then(
      (result) => complete(null, result),
      (error) => complete(error || new Error('Handler promise rejected')),
    );
  } else if (returned !== undefined || handler.fn.length < 3) {
    complete(null, returned);
  }
}

main();
"#;
